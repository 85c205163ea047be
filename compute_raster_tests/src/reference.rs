// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Brute-force rasterization, visiting every pixel and every region.
//!
//! Sampling follows the kernels: a pixel is covered when its centre is on or inside all three
//! edges and the interpolated depth is within `[0, 1]`.

use compute_raster::PrimitiveEntry;

/// A triangle mapped to pixel coordinates.
#[derive(Clone, Copy, Debug)]
pub struct ScreenTriangle {
    pub p: [[f32; 2]; 3],
    pub z: [f32; 3],
    /// Signed doubled area.
    pub area: f32,
}

fn edge(a: [f32; 2], b: [f32; 2], p: [f32; 2]) -> f32 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

impl ScreenTriangle {
    /// `None` for triangles behind the eye or without area.
    pub fn new(clip: [[f32; 4]; 3], viewport: [f32; 4]) -> Option<Self> {
        if clip.iter().any(|c| c[3] <= 0.0) {
            return None;
        }
        let mut p = [[0.0; 2]; 3];
        let mut z = [0.0; 3];
        for (i, c) in clip.iter().enumerate() {
            let [x, y] = [c[0] / c[3], c[1] / c[3]];
            p[i] = [
                viewport[0] + (x * 0.5 + 0.5) * viewport[2],
                viewport[1] + (0.5 - y * 0.5) * viewport[3],
            ];
            z[i] = c[2] / c[3];
        }
        let area = edge(p[0], p[1], p[2]);
        (area != 0.0).then_some(Self { p, z, area })
    }

    /// Depth at the centre of pixel `(x, y)`, if the triangle covers it.
    pub fn sample(&self, x: u32, y: u32) -> Option<f32> {
        let c = [x as f32 + 0.5, y as f32 + 0.5];
        let mut w = [
            edge(self.p[1], self.p[2], c),
            edge(self.p[2], self.p[0], c),
            edge(self.p[0], self.p[1], c),
        ];
        if self.area < 0.0 {
            w = w.map(|v| -v);
        }
        if w.iter().any(|v| *v < 0.0) {
            return None;
        }
        let b = w.map(|v| v / self.area.abs());
        let z = b[0] * self.z[0] + b[1] * self.z[1] + b[2] * self.z[2];
        (0.0..=1.0).contains(&z).then_some(z)
    }

    /// Whether some pixel centre of `[x0, x1] x [y0, y1]` lies in the triangle's bounding box.
    fn bounds_overlap(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> bool {
        let lo = [
            self.p[0][0].min(self.p[1][0]).min(self.p[2][0]),
            self.p[0][1].min(self.p[1][1]).min(self.p[2][1]),
        ];
        let hi = [
            self.p[0][0].max(self.p[1][0]).max(self.p[2][0]),
            self.p[0][1].max(self.p[1][1]).max(self.p[2][1]),
        ];
        let any = |a: u32, b: u32, lo: f32, hi: f32| (a..=b).any(|v| (lo..=hi).contains(&(v as f32 + 0.5)));
        any(x0, x1, lo[0], hi[0]) && any(y0, y1, lo[1], hi[1])
    }
}

/// The depth bits the kernels store for `z`.
pub fn depth_bits(z: f32) -> u32 {
    z.to_bits() & 0x7fff_ffff
}

/// Rounds like a store to an `rgba8unorm` target.
pub fn unorm8(color: [f32; 4]) -> [u8; 4] {
    color.map(|c| (0.5 + 255.0 * c.clamp(0.0, 1.0)).floor() as u8)
}

/// Every (triangle, region) pair whose region holds a pixel centre of the triangle's bounds.
///
/// Regions are `size` pixels square and numbered row-major over `width` by `height` pixels.
pub fn reference_pairs(
    triangles: &[[[f32; 4]; 3]],
    width: u32,
    height: u32,
    size: u32,
) -> Vec<PrimitiveEntry> {
    let viewport = [0.0, 0.0, width as f32, height as f32];
    let (num_x, num_y) = (width.div_ceil(size), height.div_ceil(size));
    let mut pairs = Vec::new();
    for (triangle, clip) in triangles.iter().enumerate() {
        let Some(tri) = ScreenTriangle::new(*clip, viewport) else {
            continue;
        };
        for ry in 0..num_y {
            for rx in 0..num_x {
                let x1 = ((rx + 1) * size).min(width) - 1;
                let y1 = ((ry + 1) * size).min(height) - 1;
                if tri.bounds_overlap(rx * size, ry * size, x1, y1) {
                    pairs.push(PrimitiveEntry {
                        triangle: triangle as u32,
                        region: ry * num_x + rx,
                    });
                }
            }
        }
    }
    pairs
}

/// A color and depth target drawn by brute force.
pub struct ReferenceTarget {
    pub width: u32,
    pub height: u32,
    pub color: Vec<[u8; 4]>,
    /// Depth bits, as the kernels store them.
    pub depth: Vec<u32>,
}

impl ReferenceTarget {
    pub fn new(width: u32, height: u32, clear_color: [f32; 4], clear_depth: f32) -> Self {
        let len = (width * height) as usize;
        Self {
            width,
            height,
            color: vec![unorm8(clear_color); len],
            depth: vec![depth_bits(clear_depth); len],
        }
    }

    /// Draws one batch of triangles in `color`.
    ///
    /// With a depth test, depths of the whole batch are resolved before any pixel is shaded,
    /// and a pixel is shaded by the triangle whose depth it ended up with.
    pub fn draw(&mut self, triangles: &[[[f32; 4]; 3]], color: [f32; 4], depth_test: bool) {
        let viewport = [0.0, 0.0, self.width as f32, self.height as f32];
        let triangles: Vec<_> = triangles
            .iter()
            .filter_map(|clip| ScreenTriangle::new(*clip, viewport))
            .collect();
        let rgba = unorm8(color);
        if depth_test {
            self.for_each_sample(&triangles, |target, ix, z| {
                target.depth[ix] = target.depth[ix].min(depth_bits(z));
            });
            self.for_each_sample(&triangles, |target, ix, z| {
                if target.depth[ix] == depth_bits(z) {
                    target.color[ix] = rgba;
                }
            });
        } else {
            self.for_each_sample(&triangles, |target, ix, _| target.color[ix] = rgba);
        }
    }

    fn for_each_sample(&mut self, triangles: &[ScreenTriangle], mut f: impl FnMut(&mut Self, usize, f32)) {
        for tri in triangles {
            for y in 0..self.height {
                for x in 0..self.width {
                    if let Some(z) = tri.sample(x, y) {
                        f(self, (y * self.width + x) as usize, z);
                    }
                }
            }
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        self.color[(y * self.width + x) as usize]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.color.iter().flatten().copied().collect()
    }

    pub fn depths(&self) -> Vec<f32> {
        self.depth.iter().map(|bits| f32::from_bits(*bits)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_centres_on_edges_are_covered() {
        // (0, 0), (4, 0), (0, 4) in a 4x4 target.
        let clip = [[-1.0, 1.0, 0.5, 1.0], [1.0, 1.0, 0.5, 1.0], [-1.0, -1.0, 0.5, 1.0]];
        let tri = ScreenTriangle::new(clip, [0.0, 0.0, 4.0, 4.0]).unwrap();
        assert_eq!(tri.sample(0, 0), Some(0.5));
        // Centre (1.5, 2.5) lies on the hypotenuse.
        assert!(tri.sample(1, 2).is_some());
        assert!(tri.sample(2, 2).is_none());
    }

    #[test]
    fn pairs_follow_bounds() {
        let clip = [[-1.0, 1.0, 0.5, 1.0], [-0.5, 1.0, 0.5, 1.0], [-1.0, 0.5, 0.5, 1.0]];
        // Pixels (0, 0) to (4, 4) of 16x16: the bounds reach the centre of pixel 3 only.
        let pairs = reference_pairs(&[clip], 16, 16, 4);
        assert_eq!(pairs, [PrimitiveEntry { triangle: 0, region: 0 }]);
        let pairs = reference_pairs(&[clip], 16, 16, 2);
        assert_eq!(pairs.len(), 4);
    }
}
