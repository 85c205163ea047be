// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The seam between recorded work and whatever executes it.

use std::borrow::Cow;
use std::collections::HashMap;

#[cfg(feature = "cpu")]
use compute_raster_shaders::cpu::CpuBinding;

use crate::barrier::{Barrier, ResourceState};
use crate::descriptor::DescriptorTable;
use crate::recording::{
    BindType, BufferProxy, Command, ImageProxy, Recording, ResourceId, ResourceProxy, ShaderId,
};
use crate::{Error, Result};

/// A CPU port of a kernel.
///
/// Receives the dispatch's workgroup count along `x` and the resources of every bound table,
/// flattened in group order.
#[cfg(feature = "cpu")]
pub type CpuShaderFn = fn(u32, &[CpuBinding<'_>]);

/// Everything an engine needs to create one kernel.
#[derive(Clone)]
pub struct ShaderDesc {
    pub label: &'static str,
    /// Fully preprocessed WGSL with a `main` entry point.
    pub wgsl: Cow<'static, str>,
    /// Binding types of each bind group, in group order.
    pub layout: Vec<Vec<BindType>>,
    #[cfg(feature = "cpu")]
    pub cpu: Option<CpuShaderFn>,
}

/// Limits the orchestrator sizes its buffers and dispatches against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineLimits {
    pub max_storage_buffer_binding_size: u32,
    pub max_compute_workgroups_per_dimension: u32,
}

impl Default for EngineLimits {
    /// The WebGPU defaults.
    fn default() -> Self {
        Self {
            max_storage_buffer_binding_size: 128 << 20,
            max_compute_workgroups_per_dimension: 65535,
        }
    }
}

/// Executes [`Recording`]s.
pub trait Engine {
    fn add_shader(&mut self, desc: ShaderDesc) -> Result<ShaderId>;

    /// Runs every command of `recording` in order.
    ///
    /// Resources persist between runs until they are freed.
    fn run_recording(&mut self, recording: &Recording, label: &'static str) -> Result<()>;

    /// Contents of `buf` captured by the latest [`Command::Download`] of it.
    fn download_buffer(&mut self, buf: &BufferProxy) -> Result<Vec<u8>>;

    /// Tightly packed rows of `image` captured by the latest [`Command::DownloadImage`].
    fn download_image(&mut self, image: &ImageProxy) -> Result<Vec<u8>>;

    fn limits(&self) -> EngineLimits;
}

/// Checks that `tables` fit the bind group layout a shader was created with.
pub(crate) fn check_layout(
    label: &'static str,
    layout: &[Vec<BindType>],
    tables: &[DescriptorTable],
) -> Result<()> {
    if layout.len() != tables.len() {
        return Err(Error::LayoutMismatch {
            shader: label,
            detail: format!("{} tables bound, {} groups declared", tables.len(), layout.len()),
        });
    }
    for (group, (table, expected)) in tables.iter().zip(layout).enumerate() {
        if !table.matches_layout(expected) {
            return Err(Error::LayoutMismatch {
                shader: label,
                detail: format!(
                    "group {group} ({}) is {:?}, declared {expected:?}",
                    table.label(),
                    table.layout().collect::<Vec<_>>()
                ),
            });
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default)]
struct Tracked {
    state: ResourceState,
    pending_writes: bool,
}

/// Engine-side replay of the barrier protocol.
///
/// Rejects transitions from the wrong state, bindings whose resource is in an incompatible
/// state, and accesses to resources with unsynchronised unordered writes. Uniform bindings,
/// uploads, writes, clears and downloads are not tracked.
#[derive(Debug, Default)]
pub(crate) struct ProtocolValidator {
    resources: HashMap<ResourceId, Tracked>,
}

impl ProtocolValidator {
    fn tracked(&mut self, id: ResourceId) -> &mut Tracked {
        self.resources.entry(id).or_default()
    }

    fn check_access(
        &mut self,
        resource: ResourceProxy,
        allowed: &[ResourceState],
        usage: &'static str,
    ) -> Result<()> {
        let tracked = self.tracked(resource.id());
        if !allowed.contains(&tracked.state) {
            return Err(Error::InvalidResourceState {
                resource: resource.name(),
                state: tracked.state,
                usage,
            });
        }
        if tracked.pending_writes {
            return Err(Error::MissingBarrier {
                resource: resource.name(),
                usage,
            });
        }
        Ok(())
    }

    fn check_tables(&mut self, tables: &[DescriptorTable]) -> Result<()> {
        use ResourceState::*;
        for binding in tables.iter().flat_map(|t| t.entries()) {
            match binding.ty {
                BindType::Uniform => {}
                BindType::Buffer | BindType::Image(_) => {
                    self.check_access(
                        binding.resource,
                        &[UnorderedAccess, Common],
                        "read/write binding",
                    )?;
                }
                BindType::BufReadOnly | BindType::ImageRead(_) => {
                    self.check_access(
                        binding.resource,
                        &[ShaderResource, IndirectArgument, Common],
                        "read only binding",
                    )?;
                }
            }
        }
        Ok(())
    }

    fn mark_written(&mut self, tables: &[DescriptorTable]) {
        for binding in tables.iter().flat_map(|t| t.entries()) {
            if binding.ty.is_writable() {
                self.tracked(binding.resource.id()).pending_writes = true;
            }
        }
    }

    /// Validates `command` against the tracked states and applies its effect.
    pub(crate) fn check(&mut self, command: &Command) -> Result<()> {
        use ResourceState::*;
        match command {
            Command::Barrier(barriers) => {
                for barrier in barriers {
                    match *barrier {
                        Barrier::Transition {
                            resource,
                            before,
                            after,
                        } => {
                            let tracked = self.tracked(resource.id());
                            if tracked.state != before {
                                return Err(Error::BarrierMismatch {
                                    resource: resource.name(),
                                    expected: tracked.state,
                                    found: before,
                                });
                            }
                            tracked.state = after;
                            tracked.pending_writes = false;
                        }
                        Barrier::Uav(resource) => {
                            self.tracked(resource.id()).pending_writes = false;
                        }
                    }
                }
            }
            Command::Dispatch(_, _, tables) => {
                self.check_tables(tables)?;
                self.mark_written(tables);
            }
            Command::DispatchIndirect(_, args, _, tables) => {
                self.check_access((*args).into(), &[IndirectArgument], "indirect arguments")?;
                self.check_tables(tables)?;
                self.mark_written(tables);
            }
            Command::CopyBuffer { src, dst, .. } => {
                self.check_access((*src).into(), &[CopySource, Common], "copy source")?;
                self.check_access((*dst).into(), &[CopyDest, Common], "copy destination")?;
                self.tracked(dst.id).pending_writes = true;
            }
            Command::FreeBuffer(buf) => {
                self.resources.remove(&buf.id);
            }
            Command::FreeImage(image) => {
                self.resources.remove(&image.id);
            }
            Command::Upload(..)
            | Command::UploadUniform(..)
            | Command::UploadImage(..)
            | Command::Write(..)
            | Command::Download(..)
            | Command::DownloadImage(..)
            | Command::Clear(..) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;

    fn transition(buf: BufferProxy, before: ResourceState, after: ResourceState) -> Command {
        Command::Barrier(smallvec![Barrier::Transition {
            resource: buf.into(),
            before,
            after,
        }])
    }

    #[test]
    fn transition_must_start_from_tracked_state() {
        let buf = BufferProxy::new(16, "buf");
        let mut validator = ProtocolValidator::default();
        let wrong = transition(buf, ResourceState::ShaderResource, ResourceState::UnorderedAccess);
        assert!(matches!(
            validator.check(&wrong),
            Err(Error::BarrierMismatch {
                expected: ResourceState::Common,
                found: ResourceState::ShaderResource,
                ..
            })
        ));
        let right = transition(buf, ResourceState::Common, ResourceState::UnorderedAccess);
        validator.check(&right).unwrap();
    }

    #[test]
    fn reads_after_writes_need_a_barrier() {
        let buf = BufferProxy::new(16, "buf");
        let write = DescriptorTable::builder("w").read_write(buf).build();
        let read = DescriptorTable::builder("r").read_only(buf).build();
        let mut validator = ProtocolValidator::default();
        validator
            .check(&Command::Dispatch(ShaderId(0), (1, 1, 1), vec![write.clone()]))
            .unwrap();
        let err = validator
            .check(&Command::Dispatch(ShaderId(1), (1, 1, 1), vec![read.clone()]))
            .unwrap_err();
        assert!(matches!(err, Error::MissingBarrier { resource: "buf", .. }));

        let mut validator = ProtocolValidator::default();
        validator
            .check(&transition(buf, ResourceState::Common, ResourceState::UnorderedAccess))
            .unwrap();
        validator
            .check(&Command::Dispatch(ShaderId(0), (1, 1, 1), vec![write]))
            .unwrap();
        validator
            .check(&transition(
                buf,
                ResourceState::UnorderedAccess,
                ResourceState::ShaderResource,
            ))
            .unwrap();
        validator
            .check(&Command::Dispatch(ShaderId(1), (1, 1, 1), vec![read]))
            .unwrap();
    }

    #[test]
    fn indirect_arguments_need_their_state() {
        let counter = BufferProxy::new(12, "counter");
        let mut validator = ProtocolValidator::default();
        let dispatch = Command::DispatchIndirect(ShaderId(0), counter, 0, vec![]);
        assert!(matches!(
            validator.check(&dispatch),
            Err(Error::InvalidResourceState {
                state: ResourceState::Common,
                ..
            })
        ));
        validator
            .check(&transition(
                counter,
                ResourceState::Common,
                ResourceState::IndirectArgument,
            ))
            .unwrap();
        validator.check(&dispatch).unwrap();
    }

    #[test]
    fn layouts_are_compared_per_group() {
        let buf = BufferProxy::new(16, "buf");
        let table = DescriptorTable::builder("t").read_only(buf).build();
        let layout = vec![vec![BindType::BufReadOnly]];
        check_layout("k", &layout, std::slice::from_ref(&table)).unwrap();
        let wrong = vec![vec![BindType::Buffer]];
        assert!(matches!(
            check_layout("k", &wrong, std::slice::from_ref(&table)),
            Err(Error::LayoutMismatch { shader: "k", .. })
        ));
        assert!(check_layout("k", &layout, &[]).is_err());
    }
}
