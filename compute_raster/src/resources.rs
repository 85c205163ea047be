// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Handles to the resources a [`Pipeline`](crate::Pipeline) reads and writes.
//!
//! All of these are `Copy` views of proxies. The resources themselves belong to whoever
//! created them and are destroyed with [`Recording::free_buffer`](crate::Recording::free_buffer)
//! and friends.

use compute_raster_shaders::DepthLevel;

use crate::config::IndexFormat;
use crate::recording::{BufferProxy, ImageProxy};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBufferView {
    pub buffer: BufferProxy,
    pub num_vertices: u32,
    /// Byte distance between consecutive vertices.
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBufferView {
    pub buffer: BufferProxy,
    pub num_indices: u32,
    pub format: IndexFormat,
}

/// A depth buffer with its hierarchical levels.
///
/// Every level lives in one buffer of `u32` words holding the bits of non-negative `f32`
/// depths. The pixel level is indexed by target pixel and the region levels by region of the
/// target, so every cell keeps its footprint across viewports. In two-level mode the tile level
/// is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthBuffer {
    pub buffer: BufferProxy,
    pub pixel: DepthLevel,
    pub tile: DepthLevel,
    pub bin: DepthLevel,
}

fn div_up(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor)
}

impl DepthBuffer {
    /// Levels of a `width` by `height` buffer, followed by its total size in words.
    ///
    /// `tile_size` is `None` when there is no tile level.
    pub fn levels(
        width: u32,
        height: u32,
        tile_size: Option<u32>,
        bin_size: u32,
    ) -> ([DepthLevel; 3], u32) {
        let pixel = DepthLevel {
            offset: 0,
            width,
            height,
            _padding: 0,
        };
        let tile = match tile_size {
            Some(size) => DepthLevel {
                offset: pixel.len(),
                width: div_up(width, size),
                height: div_up(height, size),
                _padding: 0,
            },
            None => DepthLevel {
                offset: pixel.len(),
                ..Default::default()
            },
        };
        let bin = DepthLevel {
            offset: tile.offset + tile.len(),
            width: div_up(width, bin_size),
            height: div_up(height, bin_size),
            _padding: 0,
        };
        let words = bin.offset + bin.len();
        ([pixel, tile, bin], words)
    }

    pub fn width(&self) -> u32 {
        self.pixel.width
    }

    pub fn height(&self) -> u32 {
        self.pixel.height
    }

    /// Number of `u32` words across every level.
    pub fn words(&self) -> u32 {
        self.bin.offset + self.bin.len()
    }

    /// The pixel level of downloaded contents, as depths.
    pub fn pixel_depths(&self, bytes: &[u8]) -> Vec<f32> {
        Self::level_depths(&self.pixel, bytes)
    }

    /// The level `level` of downloaded contents, as depths.
    pub fn level_depths(level: &DepthLevel, bytes: &[u8]) -> Vec<f32> {
        let start = level.offset as usize * 4;
        let end = start + level.len() as usize * 4;
        bytes
            .get(start..end)
            .unwrap_or_default()
            .chunks_exact(4)
            .map(|word| f32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            .collect()
    }
}

/// Read-only views of the primitive lists and their counters.
///
/// Each counter holds `{count, 1, 1}` after a draw; each list holds `count` valid
/// [`PrimitiveEntry`](compute_raster_shaders::PrimitiveEntry)s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrimitiveLists {
    pub bin_counter: BufferProxy,
    pub bin_list: BufferProxy,
    pub tile_counter: Option<BufferProxy>,
    pub tile_list: Option<BufferProxy>,
}

/// Primitive counts of the latest draw, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// (triangle, bin) pairs appended.
    pub bins: u32,
    /// (triangle, tile) pairs appended, in three-level mode.
    pub tiles: Option<u32>,
}

/// The render targets of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RenderTargets {
    pub color: ImageProxy,
    pub depth: Option<DepthBuffer>,
}
