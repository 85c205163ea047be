// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::raster::{
    Triangle, Vec2, depth_bits, inside, lower_bound, occluded, region_corners, viewport_span,
};
use super::{CpuBinding, CpuTexture};
use crate::types::{DepthLevel, Grid, PrimitiveEntry, RasterUniform, Shading};

const WG_SIZE: u32 = 64;

/// Attribute 0 with the component counts of the raster uniform.
struct Normals<'a> {
    data: &'a [f32],
    stride: u32,
    components: u32,
}

impl Normals<'_> {
    fn load(&self, slot: u32) -> [f32; 4] {
        let mut value = [0.0; 4];
        let base = slot * self.stride;
        for c in 0..self.components.min(4) {
            value[c as usize] = self.data.get((base + c) as usize).copied().unwrap_or(0.0);
        }
        value
    }

    fn interpolate(&self, tri_ix: u32, tri: &Triangle, b: [f32; 3]) -> [f32; 4] {
        let pw = [b[0] * tri.inv_w[0], b[1] * tri.inv_w[1], b[2] * tri.inv_w[2]];
        let sum = pw[0] + pw[1] + pw[2];
        let mut out = [0.0; 4];
        for v in 0..3 {
            let a = self.load(tri_ix * 3 + v as u32);
            for c in 0..4 {
                out[c] += pw[v] * a[c];
            }
        }
        out.map(|c| c / sum)
    }
}

fn shade(
    shading: &Shading,
    normals: Option<&Normals<'_>>,
    tri_ix: u32,
    tri: &Triangle,
    b: [f32; 3],
) -> [f32; 4] {
    let mut rgba = shading.base_color;
    if let Some(normals) = normals
        && shading.light_dir[3] != 0.0
    {
        let n = normals.interpolate(tri_ix, tri, b);
        let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
        let d = &shading.light_dir;
        let lambert = (-(n[0] * d[0] + n[1] * d[1] + n[2] * d[2]) / len).max(0.0);
        for c in 0..3 {
            rgba[c] *= shading.ambient[c] + shading.light_color[c] * lambert;
        }
    }
    rgba
}

fn region_level(config: &RasterUniform) -> DepthLevel {
    if config.three_level() { config.tile_z } else { config.bin_z }
}

fn lower_if_covered(
    config: &RasterUniform,
    depth: &mut [u32],
    tri: &Triangle,
    grid: &Grid,
    level: &DepthLevel,
    rx: u32,
    ry: u32,
) {
    // A bound covers its region within the target, and pixels outside the viewport are never
    // written, so that whole footprint has to lie inside the viewport.
    let target = [0, 0, config.pixel_z.width, config.pixel_z.height];
    let Some((lo, hi)) = region_corners(grid, rx, ry, target) else {
        return;
    };
    let [vx0, vy0, vx1, vy1] = viewport_span(config.viewport).map(|v| v as f32);
    let in_viewport = lo.x > vx0 && lo.y > vy0 && hi.x < vx1 && hi.y < vy1;
    if in_viewport && tri.covers_rect(lo, hi) {
        lower_bound(depth, level, rx, ry, tri.z_max());
    }
}

/// What a pixel stage dispatch writes.
enum Pass<'a> {
    Depth(&'a mut [u32]),
    Color {
        shading: &'a Shading,
        target: &'a mut CpuTexture,
        depth: Option<&'a [u32]>,
        normals: Option<Normals<'a>>,
    },
}

fn pixel_main(
    n_wg: u32,
    config: &RasterUniform,
    positions: &[[f32; 4]],
    primitives: &[PrimitiveEntry],
    mut pass: Pass<'_>,
) {
    let grid = config.finest_grid();
    let [vx0, vy0, vx1, vy1] = viewport_span(config.viewport);
    for wg in 0..n_wg {
        if wg >= grid.capacity {
            break;
        }
        let pair = primitives[wg as usize];
        let Some(tri) = Triangle::load(positions, pair.triangle, config.viewport) else {
            continue;
        };
        let rx = pair.region % grid.num_x;
        let ry = pair.region / grid.num_x;
        if let Pass::Depth(depth) = &pass
            && occluded(depth, &region_level(config), rx, ry, tri.z_min())
        {
            continue;
        }
        for local_ix in 0..WG_SIZE {
            let mut i = local_ix;
            while i < grid.size * grid.size {
                let pixel = [rx * grid.size + i % grid.size, ry * grid.size + i / grid.size];
                i += WG_SIZE;
                if pixel[0] < vx0 || pixel[0] >= vx1 || pixel[1] < vy0 || pixel[1] >= vy1 {
                    continue;
                }
                let centre = Vec2::new(pixel[0] as f32 + 0.5, pixel[1] as f32 + 0.5);
                let w = tri.edge_weights(centre);
                if !inside(w) {
                    continue;
                }
                let b = w.map(|v| v / tri.area.abs());
                let z = tri.depth_at(w);
                if !(0.0..=1.0).contains(&z) {
                    continue;
                }
                match &mut pass {
                    Pass::Depth(depth) => {
                        if let Some(ix) = config.pixel_z.index(pixel[0], pixel[1]) {
                            depth[ix] = depth[ix].min(depth_bits(z));
                        }
                    }
                    Pass::Color {
                        shading,
                        target,
                        depth,
                        normals,
                    } => {
                        if let Some(depth) = depth {
                            match config.pixel_z.index(pixel[0], pixel[1]) {
                                Some(ix) if depth[ix] == depth_bits(z) => {}
                                _ => continue,
                            }
                        }
                        let rgba = shade(shading, normals.as_ref(), pair.triangle, &tri, b);
                        target.store(pixel[0], pixel[1], rgba);
                    }
                }
            }
        }
        if let Pass::Depth(depth) = &mut pass
            && tri.z_min() >= 0.0
            && tri.z_max() <= 1.0
        {
            lower_if_covered(config, depth, &tri, &grid, &region_level(config), rx, ry);
            if config.three_level() {
                let ratio = config.bin.size / config.tile.size;
                let (bx, by) = (rx / ratio, ry / ratio);
                lower_if_covered(config, depth, &tri, &config.bin, &config.bin_z, bx, by);
            }
        }
    }
}

/// Resolves pixel depths and lowers hierarchical bounds of fully covered regions.
///
/// Resources: shading (unused), raster uniform, positions, primitive list, depth.
pub fn pixel_depth(n_wg: u32, resources: &[CpuBinding<'_>]) {
    let config = resources[1].as_typed::<RasterUniform>();
    let positions = resources[2].as_slice::<[f32; 4]>();
    let primitives = resources[3].as_slice::<PrimitiveEntry>();
    let mut depth = resources[4].as_slice_mut::<u32>();
    pixel_main(
        n_wg,
        &config,
        &positions,
        &primitives,
        Pass::Depth(&mut depth),
    );
}

/// Shades covered pixels, restricted to the resolved depth when depth is enabled.
///
/// Resources: shading, raster uniform, positions, primitive list, color target, the depth
/// buffer when depth is enabled, then the attribute buffers.
pub fn pixel_raster(n_wg: u32, resources: &[CpuBinding<'_>]) {
    let shading = resources[0].as_typed::<Shading>();
    let config = resources[1].as_typed::<RasterUniform>();
    let positions = resources[2].as_slice::<[f32; 4]>();
    let primitives = resources[3].as_slice::<PrimitiveEntry>();
    let mut target = resources[4].as_tex_mut();
    let (depth, attrib_start) = if config.has_depth() {
        (Some(resources[5].as_slice::<u32>()), 6)
    } else {
        (None, 5)
    };
    let attrib0 = resources.get(attrib_start).map(|r| r.as_slice::<f32>());
    let normals = attrib0.as_deref().map(|data| Normals {
        data,
        stride: config.attrib_stride[0],
        components: config.attrib_components[0],
    });
    pixel_main(
        n_wg,
        &config,
        &positions,
        &primitives,
        Pass::Color {
            shading: &shading,
            target: &mut target,
            depth: depth.as_deref(),
            normals,
        },
    );
}
