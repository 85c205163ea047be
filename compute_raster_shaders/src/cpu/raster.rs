// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Screen-space triangle setup, mirroring `shader/shared/raster.wgsl`.

use crate::types::{DepthLevel, Grid};

#[derive(Clone, Copy, Default, Debug, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn min(self, other: Self) -> Self {
        Self::new(self.x.min(other.x), self.y.min(other.y))
    }

    fn max(self, other: Self) -> Self {
        Self::new(self.x.max(other.x), self.y.max(other.y))
    }
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

fn to_screen(clip: [f32; 4], viewport: [f32; 4]) -> (Vec2, f32) {
    let [x, y, z] = [clip[0] / clip[3], clip[1] / clip[3], clip[2] / clip[3]];
    let sx = viewport[0] + (x * 0.5 + 0.5) * viewport[2];
    let sy = viewport[1] + (0.5 - y * 0.5) * viewport[3];
    (Vec2::new(sx, sy), z)
}

#[derive(Clone, Copy, Debug)]
pub struct Triangle {
    pub p: [Vec2; 3],
    pub z: [f32; 3],
    pub inv_w: [f32; 3],
    /// Signed doubled area.
    pub area: f32,
}

impl Triangle {
    /// Returns `None` for triangles with a vertex at or behind the eye, or with zero area.
    pub fn setup(clip: [[f32; 4]; 3], viewport: [f32; 4]) -> Option<Self> {
        if clip.iter().any(|c| c[3] <= 0.0) {
            return None;
        }
        let mut p = [Vec2::default(); 3];
        let mut z = [0.0; 3];
        let mut inv_w = [0.0; 3];
        for i in 0..3 {
            (p[i], z[i]) = to_screen(clip[i], viewport);
            inv_w[i] = 1.0 / clip[i][3];
        }
        let area = edge(p[0], p[1], p[2]);
        (area != 0.0).then_some(Self { p, z, inv_w, area })
    }

    pub fn load(positions: &[[f32; 4]], tri_ix: u32, viewport: [f32; 4]) -> Option<Self> {
        let base = tri_ix as usize * 3;
        let clip = positions.get(base..base + 3)?;
        Self::setup([clip[0], clip[1], clip[2]], viewport)
    }

    /// Edge values at `p`, oriented so all three are non-negative inside.
    pub fn edge_weights(&self, p: Vec2) -> [f32; 3] {
        let w = [
            edge(self.p[1], self.p[2], p),
            edge(self.p[2], self.p[0], p),
            edge(self.p[0], self.p[1], p),
        ];
        if self.area < 0.0 { w.map(|v| -v) } else { w }
    }

    pub fn z_min(&self) -> f32 {
        self.z[0].min(self.z[1]).min(self.z[2])
    }

    pub fn z_max(&self) -> f32 {
        self.z[0].max(self.z[1]).max(self.z[2])
    }

    /// Inclusive target pixel range `[x0, y0, x1, y1]` covering the pixel centres in the
    /// triangle's bounds, clipped to the viewport. Empty when `x0 > x1` or `y0 > y1`.
    pub fn pixel_bounds(&self, viewport: [f32; 4]) -> [i32; 4] {
        let lo = self.p[0].min(self.p[1]).min(self.p[2]);
        let hi = self.p[0].max(self.p[1]).max(self.p[2]);
        let [vx0, vy0, vx1, vy1] = viewport_span(viewport).map(|v| v as f32);
        let x0 = (lo.x - 0.5).ceil().clamp(vx0, vx1);
        let y0 = (lo.y - 0.5).ceil().clamp(vy0, vy1);
        let x1 = (hi.x - 0.5).floor().clamp(vx0 - 1.0, vx1 - 1.0);
        let y1 = (hi.y - 0.5).floor().clamp(vy0 - 1.0, vy1 - 1.0);
        [x0 as i32, y0 as i32, x1 as i32, y1 as i32]
    }

    /// Depth at a pixel centre with edge values `w`.
    ///
    /// The depth and color passes both go through this, and the color pass keeps a pixel only
    /// when the result is bit-equal to the resolved depth.
    pub fn depth_at(&self, w: [f32; 3]) -> f32 {
        let area = self.area.abs();
        let b = w.map(|v| v / area);
        b[0] * self.z[0] + b[1] * self.z[1] + b[2] * self.z[2]
    }

    fn corner_weights(&self, lo: Vec2, hi: Vec2) -> [[f32; 3]; 4] {
        [
            self.edge_weights(lo),
            self.edge_weights(Vec2::new(hi.x, lo.y)),
            self.edge_weights(Vec2::new(lo.x, hi.y)),
            self.edge_weights(hi),
        ]
    }

    /// False when every corner pixel centre is outside one edge.
    pub fn touches_rect(&self, lo: Vec2, hi: Vec2) -> bool {
        let corners = self.corner_weights(lo, hi);
        (0..3).all(|e| corners.iter().any(|w| w[e] >= 0.0))
    }

    /// True when all four corner pixel centres are inside.
    pub fn covers_rect(&self, lo: Vec2, hi: Vec2) -> bool {
        self.corner_weights(lo, hi).iter().all(|w| inside(*w))
    }
}

pub fn inside(w: [f32; 3]) -> bool {
    w.iter().all(|v| *v >= 0.0)
}

/// Target pixels a viewport covers, as `[x0, y0, x1, y1)`.
pub fn viewport_span(viewport: [f32; 4]) -> [u32; 4] {
    let x0 = viewport[0] as u32;
    let y0 = viewport[1] as u32;
    [x0, y0, x0 + viewport[2] as u32, y0 + viewport[3] as u32]
}

/// Screen-space centres of the first and last pixel of a region, clipped to the pixel span
/// `clip`. `None` when nothing of the region is left.
pub fn region_corners(grid: &Grid, rx: u32, ry: u32, clip: [u32; 4]) -> Option<(Vec2, Vec2)> {
    let x0 = (rx * grid.size).max(clip[0]);
    let y0 = (ry * grid.size).max(clip[1]);
    let x1 = ((rx + 1) * grid.size).min(clip[2]);
    let y1 = ((ry + 1) * grid.size).min(clip[3]);
    (x0 < x1 && y0 < y1).then(|| {
        (
            Vec2::new(x0 as f32 + 0.5, y0 as f32 + 0.5),
            Vec2::new(x1 as f32 - 0.5, y1 as f32 - 0.5),
        )
    })
}

/// Clears the sign bit so a negative zero compares equal to zero.
pub fn depth_bits(z: f32) -> u32 {
    z.to_bits() & 0x7fff_ffff
}

/// True when every depth the triangle can produce is behind the stored far bound.
pub fn occluded(depth: &[u32], level: &DepthLevel, x: u32, y: u32, near: f32) -> bool {
    level
        .index(x, y)
        .is_some_and(|ix| near > f32::from_bits(depth[ix]))
}

pub fn lower_bound(depth: &mut [u32], level: &DepthLevel, x: u32, y: u32, far: f32) {
    if let Some(ix) = level.index(x, y) {
        depth[ix] = depth[ix].min(depth_bits(far));
    }
}
