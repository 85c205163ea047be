// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Types shared between the host, the WGSL kernels and their CPU ports.
//!
//! Every struct here is `#[repr(C)]` and mirrors a WGSL struct in `shader/shared/uniforms.wgsl`.
//! Uniform structs keep 16 byte alignment for nested structs and vectors.

use bytemuck::{Pod, Zeroable};

/// Depth written by a depth clear unless another value is requested.
pub const DEPTH_CLEAR: f32 = 1.0;

/// Set in [`RasterUniform::flags`] when the tiling stage runs between binning and pixel stages.
pub const RASTER_FLAG_THREE_LEVEL: u32 = 1;
/// Set in [`RasterUniform::flags`] when a depth buffer is bound.
pub const RASTER_FLAG_DEPTH: u32 = 2;

/// One level of the primitive grid: region size in pixels, region counts and list capacity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct Grid {
    pub size: u32,
    pub num_x: u32,
    pub num_y: u32,
    /// Maximum number of entries the level's primitive list can hold.
    pub capacity: u32,
}

impl Grid {
    pub fn num_regions(&self) -> u32 {
        self.num_x * self.num_y
    }
}

/// Placement of one depth level inside the shared depth buffer, in `u32` words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct DepthLevel {
    pub offset: u32,
    pub width: u32,
    pub height: u32,
    pub _padding: u32,
}

impl DepthLevel {
    pub fn len(&self) -> u32 {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Word index of `(x, y)`, or `None` when outside the level.
    pub fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height).then(|| (self.offset + y * self.width + x) as usize)
    }
}

/// Per-draw constants of the binning, tiling and pixel stages.
#[derive(Clone, Copy, Debug, Default, Zeroable, Pod)]
#[repr(C)]
pub struct RasterUniform {
    /// Viewport origin and size in pixels: x, y, width, height.
    pub viewport: [f32; 4],
    pub num_triangles: u32,
    pub flags: u32,
    pub _padding: [u32; 2],
    pub bin: Grid,
    pub tile: Grid,
    pub pixel_z: DepthLevel,
    pub tile_z: DepthLevel,
    pub bin_z: DepthLevel,
    /// Output stride of each attribute, in `f32` words.
    pub attrib_stride: [u32; 4],
    pub attrib_components: [u32; 4],
}

impl RasterUniform {
    pub fn three_level(&self) -> bool {
        self.flags & RASTER_FLAG_THREE_LEVEL != 0
    }

    pub fn has_depth(&self) -> bool {
        self.flags & RASTER_FLAG_DEPTH != 0
    }

    /// The grid whose regions the pixel stage works on.
    pub fn finest_grid(&self) -> Grid {
        if self.three_level() { self.tile } else { self.bin }
    }
}

/// Per-draw constants of the vertex stage.
#[derive(Clone, Copy, Debug, Default, Zeroable, Pod)]
#[repr(C)]
pub struct VertexUniform {
    /// Number of vertices (or indices) to process.
    pub count: u32,
    /// Input vertex stride in `f32` words.
    pub vertex_stride: u32,
    pub num_attributes: u32,
    /// Non-zero when indices are packed as `u16`.
    pub index_u16: u32,
    /// Input offset of each attribute, in `f32` words from the start of a vertex.
    pub attrib_offset: [u32; 4],
    pub attrib_components: [u32; 4],
    /// Output stride of each attribute, in `f32` words.
    pub attrib_stride: [u32; 4],
}

/// The transform bound as the first external table of the built-in vertex kernel.
#[derive(Clone, Copy, Debug, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct Transform {
    /// Column-major world-view-projection matrix.
    pub world_view_proj: [[f32; 4]; 4],
}

impl Transform {
    pub const IDENTITY: Self = Self {
        world_view_proj: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    pub fn apply(&self, p: [f32; 4]) -> [f32; 4] {
        let m = &self.world_view_proj;
        let mut out = [0.0; 4];
        for (row, value) in out.iter_mut().enumerate() {
            *value = m[0][row] * p[0] + m[1][row] * p[1] + m[2][row] * p[2] + m[3][row] * p[3];
        }
        out
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Material and light constants bound as the first external table of the built-in pixel kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct Shading {
    pub base_color: [f32; 4],
    pub ambient: [f32; 4],
    pub light_color: [f32; 4],
    /// Direction the light travels in. Lighting is disabled when `w` is zero.
    pub light_dir: [f32; 4],
}

impl Shading {
    /// Unlit shading with a single color.
    pub fn flat(base_color: [f32; 4]) -> Self {
        Self {
            base_color,
            ..Default::default()
        }
    }

    /// Directional lighting using attribute 0 as the surface normal.
    pub fn lit(base_color: [f32; 4], ambient: [f32; 3], light_color: [f32; 3], dir: [f32; 3]) -> Self {
        Self {
            base_color,
            ambient: [ambient[0], ambient[1], ambient[2], 0.0],
            light_color: [light_color[0], light_color[1], light_color[2], 0.0],
            light_dir: [dir[0], dir[1], dir[2], 1.0],
        }
    }
}

/// A (triangle, region) pair appended by the binning and tiling stages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Zeroable, Pod)]
#[repr(C)]
pub struct PrimitiveEntry {
    pub triangle: u32,
    /// Row-major index of the bin or tile.
    pub region: u32,
}

/// Arguments of one indirect compute dispatch.
///
/// Primitive counters use this layout directly: `x` is the atomic append count and `y` and `z`
/// stay at one, so a counter can be consumed as dispatch arguments without a setup pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct DispatchIndirectArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchIndirectArgs {
    /// Counter contents at the start of every rasterization pass.
    pub const RESET: Self = Self { x: 0, y: 1, z: 1 };
}

#[derive(Clone, Copy, Debug, Default, Zeroable, Pod)]
#[repr(C)]
pub struct ClearColor {
    pub color: [f32; 4],
}

#[derive(Clone, Copy, Debug, Default, Zeroable, Pod)]
#[repr(C)]
pub struct ClearDepth {
    /// Bit pattern written to every word.
    pub value: u32,
    pub count: u32,
    pub _padding: [u32; 2],
}

const _: [(); 144] = [(); size_of::<RasterUniform>()];
const _: [(); 64] = [(); size_of::<VertexUniform>()];
const _: [(); 12] = [(); size_of::<DispatchIndirectArgs>()];
const _: [(); 8] = [(); size_of::<PrimitiveEntry>()];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_offsets_match_wgsl() {
        assert_eq!(core::mem::offset_of!(RasterUniform, bin), 32);
        assert_eq!(core::mem::offset_of!(RasterUniform, tile), 48);
        assert_eq!(core::mem::offset_of!(RasterUniform, pixel_z), 64);
        assert_eq!(core::mem::offset_of!(RasterUniform, bin_z), 96);
        assert_eq!(core::mem::offset_of!(RasterUniform, attrib_stride), 112);
        assert_eq!(core::mem::offset_of!(VertexUniform, attrib_offset), 16);
        assert_eq!(size_of::<Shading>(), 64);
    }

    #[test]
    fn transform_is_column_major() {
        let mut t = Transform::IDENTITY;
        t.world_view_proj[3] = [2.0, 3.0, 4.0, 1.0];
        assert_eq!(t.apply([1.0, 1.0, 1.0, 1.0]), [3.0, 4.0, 5.0, 1.0]);
    }

    #[test]
    fn depth_level_index() {
        let level = DepthLevel {
            offset: 100,
            width: 4,
            height: 2,
            _padding: 0,
        };
        assert_eq!(level.index(1, 1), Some(105));
        assert_eq!(level.index(4, 0), None);
        assert_eq!(level.index(0, 2), None);
    }
}
