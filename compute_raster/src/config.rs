// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pipeline configuration and the region grids derived from it.

use compute_raster_shaders::Grid;
use peniko::Color;

use crate::shaders::ShaderSource;
use crate::{Error, Result};

/// Edge length of a tile in pixels.
pub const TILE_SIZE: u32 = 8;

/// Tiles per bin edge in three-level mode.
pub const DEFAULT_BIN_RATIO: u32 = 8;

/// Color a target is cleared to unless another one is requested.
pub const CLEAR_COLOR: Color = Color::new([0.0, 0.2, 0.4, 1.0]);

/// Default number of entries in each primitive list.
///
/// Counters are consumed directly as workgroup counts along `x`, so a list never usefully holds
/// more entries than one dispatch dimension allows.
pub const DEFAULT_LIST_CAPACITY: u32 = 65535;

/// The region levels triangles are sorted into before pixels are shaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinningMode {
    /// Triangles are binned straight into the regions the pixel stage works on.
    TwoLevel,
    /// Triangles are binned into coarse bins, then subdivided into tiles.
    ThreeLevel,
}

impl Default for BinningMode {
    fn default() -> Self {
        if cfg!(feature = "three_level") {
            Self::ThreeLevel
        } else {
            Self::TwoLevel
        }
    }
}

/// The part of the render target triangles are mapped onto, in pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    /// A viewport covering a whole `width` by `height` target.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
        }
    }

    /// `[x, y, width, height]`, as the kernels read it.
    pub fn to_array(self) -> [f32; 4] {
        [self.x, self.y, self.width, self.height]
    }

    /// Target pixels the viewport covers, as `[x0, y0, x1, y1)`.
    pub fn pixel_span(&self) -> [u32; 4] {
        let x0 = self.x as u32;
        let y0 = self.y as u32;
        [x0, y0, x0 + self.width as u32, y0 + self.height as u32]
    }

    /// Number of regions of `size` pixels along each axis, counted from the target origin to
    /// the far edge of the viewport.
    ///
    /// Regions are aligned to the target rather than the viewport, so a region and its
    /// hierarchical depth bound cover the same pixels whatever the viewport.
    pub fn regions(&self, size: u32) -> (u32, u32) {
        let [_, _, x1, y1] = self.pixel_span();
        (x1.div_ceil(size), y1.div_ceil(size))
    }
}

/// Options of a [`Pipeline`](crate::Pipeline), fixed when it is built.
#[derive(Clone, Debug)]
pub struct RasterConfig {
    pub mode: BinningMode,
    /// Edge length in pixels of the finest region.
    pub tile_size: u32,
    /// Tiles per bin edge. Only used in three-level mode.
    pub bin_ratio: u32,
    /// Entries in the (triangle, bin) list.
    pub bin_list_capacity: u32,
    /// Entries in the (triangle, tile) list. Only used in three-level mode.
    pub tile_list_capacity: u32,
    /// Used by clears that don't name a color.
    pub clear_color: Color,
    pub clear_depth: f32,
    pub shader_source: ShaderSource,
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            mode: BinningMode::default(),
            tile_size: TILE_SIZE,
            bin_ratio: DEFAULT_BIN_RATIO,
            bin_list_capacity: DEFAULT_LIST_CAPACITY,
            tile_list_capacity: DEFAULT_LIST_CAPACITY,
            clear_color: CLEAR_COLOR,
            clear_depth: compute_raster_shaders::DEPTH_CLEAR,
            shader_source: ShaderSource::default(),
        }
    }
}

impl RasterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 || !self.tile_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "tile size must be a non-zero power of two, got {}",
                self.tile_size
            )));
        }
        if self.mode == BinningMode::ThreeLevel {
            if self.bin_ratio == 0 || !self.bin_ratio.is_power_of_two() {
                return Err(Error::InvalidConfig(format!(
                    "bin ratio must be a non-zero power of two, got {}",
                    self.bin_ratio
                )));
            }
            if self.tile_list_capacity == 0 {
                return Err(Error::InvalidConfig("tile list capacity is zero".into()));
            }
        }
        if self.bin_list_capacity == 0 {
            return Err(Error::InvalidConfig("bin list capacity is zero".into()));
        }
        if !(0.0..=1.0).contains(&self.clear_depth) {
            return Err(Error::InvalidConfig(format!(
                "clear depth {} is outside [0, 1]",
                self.clear_depth
            )));
        }
        Ok(())
    }

    /// Edge length of a bin in pixels.
    ///
    /// In two-level mode bins are the finest regions, so this is the tile size.
    pub fn bin_size(&self) -> u32 {
        match self.mode {
            BinningMode::TwoLevel => self.tile_size,
            BinningMode::ThreeLevel => self.tile_size * self.bin_ratio,
        }
    }

    /// The bin and tile grids covering `viewport`, aligned to the target origin.
    ///
    /// In two-level mode the tile grid is empty.
    pub fn grids(&self, viewport: &Viewport, bin_capacity: u32, tile_capacity: u32) -> (Grid, Grid) {
        let grid = |size: u32, capacity: u32| {
            let (num_x, num_y) = viewport.regions(size);
            Grid {
                size,
                num_x,
                num_y,
                capacity,
            }
        };
        let bin = grid(self.bin_size(), bin_capacity);
        let tile = match self.mode {
            BinningMode::TwoLevel => Grid::default(),
            BinningMode::ThreeLevel => grid(self.tile_size, tile_capacity),
        };
        (bin, tile)
    }
}

/// Element type of an index buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    /// Packed two per word.
    Uint16,
    #[default]
    Uint32,
}

impl IndexFormat {
    pub fn byte_size(self) -> u32 {
        match self {
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

/// Render targets the pipeline writes besides color.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutputLayout {
    /// Test and write a depth buffer.
    pub depth: bool,
}

/// Format of one vertex attribute, in the vertex buffer and in its output buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    R32Float,
    Rg32Float,
    Rgb32Float,
    Rgba32Float,
}

impl VertexFormat {
    pub fn components(self) -> u32 {
        match self {
            Self::R32Float => 1,
            Self::Rg32Float => 2,
            Self::Rgb32Float => 3,
            Self::Rgba32Float => 4,
        }
    }

    pub fn byte_size(self) -> u32 {
        self.components() * 4
    }
}

/// A per-vertex output besides the clip position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    /// Byte distance between consecutive vertices in the output buffer.
    pub stride: u32,
    pub format: VertexFormat,
    pub name: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_level_grid_uses_tiles_as_bins() {
        let config = RasterConfig {
            mode: BinningMode::TwoLevel,
            ..Default::default()
        };
        let (bin, tile) = config.grids(&Viewport::new(800, 600), 100, 200);
        assert_eq!((bin.size, bin.num_x, bin.num_y, bin.capacity), (8, 100, 75, 100));
        assert_eq!(tile, Grid::default());
    }

    #[test]
    fn three_level_grids_round_up() {
        let config = RasterConfig {
            mode: BinningMode::ThreeLevel,
            ..Default::default()
        };
        let (bin, tile) = config.grids(&Viewport::new(801, 600), 10, 20);
        assert_eq!((bin.size, bin.num_x, bin.num_y), (64, 13, 10));
        assert_eq!((tile.size, tile.num_x, tile.num_y, tile.capacity), (8, 101, 75, 20));
    }

    #[test]
    fn offset_viewport_grids_start_at_target_origin() {
        let config = RasterConfig {
            mode: BinningMode::ThreeLevel,
            ..Default::default()
        };
        let viewport = Viewport {
            x: 100.0,
            y: 20.0,
            width: 28.0,
            height: 44.0,
        };
        assert_eq!(viewport.pixel_span(), [100, 20, 128, 64]);
        let (bin, tile) = config.grids(&viewport, 10, 20);
        assert_eq!((bin.num_x, bin.num_y), (2, 1));
        assert_eq!((tile.num_x, tile.num_y), (16, 8));
    }

    #[test]
    fn validation() {
        RasterConfig::default().validate().unwrap();
        let bad_tile = RasterConfig {
            tile_size: 6,
            ..Default::default()
        };
        assert!(matches!(bad_tile.validate(), Err(Error::InvalidConfig(_))));
        let bad_capacity = RasterConfig {
            bin_list_capacity: 0,
            ..Default::default()
        };
        assert!(bad_capacity.validate().is_err());
        let bad_ratio = RasterConfig {
            mode: BinningMode::ThreeLevel,
            bin_ratio: 3,
            ..Default::default()
        };
        assert!(bad_ratio.validate().is_err());
        // The ratio is unused with two levels.
        let unused_ratio = RasterConfig {
            mode: BinningMode::TwoLevel,
            bin_ratio: 3,
            ..Default::default()
        };
        unused_ratio.validate().unwrap();
    }

    #[test]
    fn attribute_formats() {
        assert_eq!(VertexFormat::Rgb32Float.components(), 3);
        assert_eq!(VertexFormat::Rg32Float.byte_size(), 8);
        assert_eq!(IndexFormat::Uint16.byte_size(), 2);
    }
}
