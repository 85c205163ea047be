// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::raster::{Triangle, occluded};
use super::{CpuBinding, append};
use crate::types::{DispatchIndirectArgs, PrimitiveEntry, RasterUniform};

const WG_SIZE: usize = 64;

fn bin_raster_main(
    n_wg: u32,
    config: &RasterUniform,
    positions: &[[f32; 4]],
    count: &mut DispatchIndirectArgs,
    list: &mut [PrimitiveEntry],
    depth: Option<&[u32]>,
) {
    let bin = config.bin;
    for wg in 0..n_wg as usize {
        for local_ix in 0..WG_SIZE {
            let tri_ix = (wg * WG_SIZE + local_ix) as u32;
            if tri_ix >= config.num_triangles {
                return;
            }
            let Some(tri) = Triangle::load(positions, tri_ix, config.viewport) else {
                continue;
            };
            let [x0, y0, x1, y1] = tri.pixel_bounds(config.viewport);
            if x0 > x1 || y0 > y1 {
                continue;
            }
            let size = bin.size as i32;
            for y in (y0 / size) as u32..=(y1 / size) as u32 {
                for x in (x0 / size) as u32..=(x1 / size) as u32 {
                    if let Some(depth) = depth
                        && occluded(depth, &config.bin_z, x, y, tri.z_min())
                    {
                        continue;
                    }
                    let entry = PrimitiveEntry {
                        triangle: tri_ix,
                        region: y * bin.num_x + x,
                    };
                    append(count, list, bin.capacity, entry);
                }
            }
        }
    }
}

/// Resources: raster uniform, positions, bin counter, bin list, and the depth buffer when
/// depth is enabled.
pub fn bin_raster(n_wg: u32, resources: &[CpuBinding<'_>]) {
    let config = resources[0].as_typed::<RasterUniform>();
    let positions = resources[1].as_slice::<[f32; 4]>();
    let mut count = resources[2].as_typed_mut::<DispatchIndirectArgs>();
    let mut list = resources[3].as_slice_mut::<PrimitiveEntry>();
    let depth = config.has_depth().then(|| resources[4].as_slice::<u32>());
    bin_raster_main(
        n_wg,
        &config,
        &positions,
        &mut count,
        &mut list,
        depth.as_deref(),
    );
}
