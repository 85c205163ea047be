// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::raster::{Triangle, occluded, region_corners, viewport_span};
use super::{CpuBinding, append};
use crate::types::{DispatchIndirectArgs, PrimitiveEntry, RasterUniform};

const WG_SIZE: u32 = 64;

fn tile_raster_main(
    n_wg: u32,
    config: &RasterUniform,
    positions: &[[f32; 4]],
    bin_list: &[PrimitiveEntry],
    count: &mut DispatchIndirectArgs,
    list: &mut [PrimitiveEntry],
    depth: Option<&[u32]>,
) {
    let (bin, tile) = (config.bin, config.tile);
    let ratio = bin.size / tile.size;
    for wg in 0..n_wg {
        if wg >= bin.capacity {
            break;
        }
        let pair = bin_list[wg as usize];
        let Some(tri) = Triangle::load(positions, pair.triangle, config.viewport) else {
            continue;
        };
        let [bx0, by0, bx1, by1] = tri.pixel_bounds(config.viewport);
        let span = viewport_span(config.viewport);
        let bin_x = pair.region % bin.num_x;
        let bin_y = pair.region / bin.num_x;
        // Threads of a workgroup append in invocation order.
        for local_ix in 0..WG_SIZE {
            let mut t = local_ix;
            while t < ratio * ratio {
                let tx = bin_x * ratio + t % ratio;
                let ty = bin_y * ratio + t / ratio;
                t += WG_SIZE;
                if tx >= tile.num_x || ty >= tile.num_y {
                    continue;
                }
                let x0 = (tx * tile.size) as i32;
                let y0 = (ty * tile.size) as i32;
                let x1 = x0 + tile.size as i32 - 1;
                let y1 = y0 + tile.size as i32 - 1;
                if x1 < bx0 || x0 > bx1 || y1 < by0 || y0 > by1 {
                    continue;
                }
                let Some((lo, hi)) = region_corners(&tile, tx, ty, span) else {
                    continue;
                };
                if !tri.touches_rect(lo, hi) {
                    continue;
                }
                if let Some(depth) = depth
                    && occluded(depth, &config.tile_z, tx, ty, tri.z_min())
                {
                    continue;
                }
                let entry = PrimitiveEntry {
                    triangle: pair.triangle,
                    region: ty * tile.num_x + tx,
                };
                append(count, list, tile.capacity, entry);
            }
        }
    }
}

/// Resources: raster uniform, positions, bin list, tile counter, tile list, and the depth
/// buffer when depth is enabled.
pub fn tile_raster(n_wg: u32, resources: &[CpuBinding<'_>]) {
    let config = resources[0].as_typed::<RasterUniform>();
    let positions = resources[1].as_slice::<[f32; 4]>();
    let bin_list = resources[2].as_slice::<PrimitiveEntry>();
    let mut count = resources[3].as_typed_mut::<DispatchIndirectArgs>();
    let mut list = resources[4].as_slice_mut::<PrimitiveEntry>();
    let depth = config.has_depth().then(|| resources[5].as_slice::<u32>());
    tile_raster_main(
        n_wg,
        &config,
        &positions,
        &bin_list,
        &mut count,
        &mut list,
        depth.as_deref(),
    );
}
