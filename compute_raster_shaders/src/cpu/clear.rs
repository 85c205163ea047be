// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::CpuBinding;
use crate::types::{ClearColor, ClearDepth};

/// Resources: clear color uniform, color target.
pub fn clear_color(_n_wg: u32, resources: &[CpuBinding<'_>]) {
    let params = resources[0].as_typed::<ClearColor>();
    let mut target = resources[1].as_tex_mut();
    let packed = super::pack_unorm4x8(params.color);
    target.pixels.fill(packed);
}

/// Resources: clear depth uniform, depth buffer.
pub fn clear_depth(_n_wg: u32, resources: &[CpuBinding<'_>]) {
    let params = resources[0].as_typed::<ClearDepth>();
    let mut depth = resources[1].as_slice_mut::<u32>();
    let count = (params.count as usize).min(depth.len());
    depth[..count].fill(params.value);
}
