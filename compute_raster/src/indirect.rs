// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The command signature for GPU-sized dispatches.

pub use compute_raster_shaders::DispatchIndirectArgs;

use crate::descriptor::DescriptorTable;
use crate::recording::{BufferProxy, Recording, ShaderId};
use crate::{Error, Result};

/// Kind of one argument in an indirect command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndirectArgument {
    /// Three `u32` workgroup counts.
    Dispatch,
}

impl IndirectArgument {
    pub const fn size(self) -> u64 {
        match self {
            Self::Dispatch => size_of::<DispatchIndirectArgs>() as u64,
        }
    }
}

/// Layout of the arguments read by an indirect dispatch.
///
/// The primitive counters are written in this layout by the kernels, so a counter buffer can be
/// handed straight to [`dispatch`](Self::dispatch).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndirectCommandLayout {
    arguments: &'static [IndirectArgument],
}

impl IndirectCommandLayout {
    /// A single dispatch argument with a 12 byte stride.
    pub const DISPATCH: Self = Self {
        arguments: &[IndirectArgument::Dispatch],
    };

    pub fn arguments(&self) -> &'static [IndirectArgument] {
        self.arguments
    }

    pub const fn stride(&self) -> u64 {
        let mut stride = 0;
        let mut i = 0;
        while i < self.arguments.len() {
            stride += self.arguments[i].size();
            i += 1;
        }
        stride
    }

    /// Checks that `args` holds at least one command.
    pub fn check(&self, args: &BufferProxy) -> Result<()> {
        if args.size < self.stride() {
            return Err(Error::InvalidConfig(format!(
                "indirect argument buffer {} holds {} bytes, need at least {}",
                args.name,
                args.size,
                self.stride()
            )));
        }
        Ok(())
    }

    /// Records a dispatch of `shader` sized by the first command in `args`.
    pub fn dispatch(
        &self,
        recording: &mut Recording,
        shader: ShaderId,
        args: BufferProxy,
        tables: impl IntoIterator<Item = DescriptorTable>,
    ) -> Result<()> {
        self.check(&args)?;
        self.record(recording, shader, args, tables);
        Ok(())
    }

    /// Like [`dispatch`](Self::dispatch), for argument buffers already passed to
    /// [`check`](Self::check).
    pub fn record(
        &self,
        recording: &mut Recording,
        shader: ShaderId,
        args: BufferProxy,
        tables: impl IntoIterator<Item = DescriptorTable>,
    ) {
        debug_assert!(args.size >= self.stride(), "unchecked argument buffer {}", args.name);
        recording.dispatch_indirect(shader, args, 0, tables);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Command;

    #[test]
    fn dispatch_layout_is_twelve_bytes() {
        assert_eq!(IndirectCommandLayout::DISPATCH.stride(), 12);
        assert_eq!(bytemuck::bytes_of(&DispatchIndirectArgs::RESET), &[0, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn rejects_short_buffers() {
        let mut recording = Recording::default();
        let short = BufferProxy::new(8, "short");
        let result = IndirectCommandLayout::DISPATCH.dispatch(&mut recording, ShaderId(0), short, Vec::<DescriptorTable>::new());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        assert!(recording.is_empty());

        let counter = BufferProxy::new(12, "counter");
        IndirectCommandLayout::DISPATCH
            .dispatch(&mut recording, ShaderId(3), counter, Vec::<DescriptorTable>::new())
            .unwrap();
        assert!(matches!(
            recording.commands[0],
            Command::DispatchIndirect(ShaderId(3), buf, 0, _) if buf == counter
        ));
    }
}
