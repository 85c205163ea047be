// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A triangle rasterizer built entirely from chained compute dispatches.
//!
//! Triangles never touch fixed-function rasterization hardware. A draw records up to five
//! compute dispatches:
//!
//! 1. the vertex stage transforms vertices into clip space and writes their attributes,
//! 2. the binning stage appends a (triangle, bin) pair for every bin a triangle overlaps,
//! 3. in [`BinningMode::ThreeLevel`], the tiling stage subdivides those pairs into tiles,
//! 4. the pixel stage covers, depth tests, interpolates and shades each (triangle, region) pair.
//!
//! The tiling and pixel stages are sized on the GPU: each consumes the counter of the list it
//! reads as indirect dispatch arguments.
//!
//! Nothing is executed while recording. A [`Pipeline`] records [`Command`]s, with the barriers
//! between stages, into a [`Recording`], which an [`Engine`] then runs. [`WgpuEngine`] runs the
//! WGSL kernels from `compute_raster_shaders` through wgpu, and [`CpuEngine`] runs CPU ports of
//! the same kernels while checking the barrier protocol.
//!
//! ## Getting started
//!
//! ```ignore
//! let mut engine = compute_raster::CpuEngine::new();
//! let mut recording = compute_raster::Recording::default();
//! let mut pipeline = compute_raster::PipelineBuilder::new(RasterConfig::default())
//!     .output_layout(OutputLayout { depth: true })
//!     .max_vertices(3)
//!     .build(&mut engine, &mut recording)?;
//!
//! let vertices = pipeline.create_vertex_buffer(&mut recording, bytemuck::cast_slice(&data), 3, 12)?;
//! let color = pipeline.create_color_target(800, 600);
//! let depth = pipeline.create_depth_buffer(800, 600);
//! pipeline.set_vertex_buffer(vertices);
//! pipeline.set_render_targets(color, Some(depth));
//! pipeline.bind_external_table(Stage::Vertex, 0, transform_table)?;
//! pipeline.bind_external_table(Stage::Pixel, 0, shading_table)?;
//! pipeline.clear_color(color, None);
//! pipeline.clear_depth(depth, None);
//! pipeline.draw(&mut recording, 3);
//! recording.download_image(color);
//! engine.run_recording(&recording, "frame")?;
//! let pixels = engine.download_image(&color)?;
//! ```

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![cfg_attr(docsrs, feature(doc_cfg))]
// The following lints are part of the Linebender standard set,
// but resolving them has been deferred for now.
// Feel free to send a PR that solves one or more of these.
#![allow(missing_docs, reason = "We have many as-yet undocumented items.")]
#![allow(
    missing_debug_implementations,
    unnameable_types,
    unreachable_pub,
    clippy::cast_possible_truncation,
    clippy::missing_assert_message,
    reason = "Deferred, only apply in some feature sets so not expect"
)]

mod barrier;
mod config;
mod descriptor;
mod engine;
mod indirect;
mod pipeline;
mod recording;
mod resources;
mod shaders;

#[cfg(feature = "cpu")]
mod cpu_engine;
#[cfg(feature = "wgpu")]
pub mod util;
#[cfg(feature = "wgpu")]
mod wgpu_engine;

/// Re-exported for [`Color`](peniko::Color), which clear colors are given in.
pub use peniko;

pub use compute_raster_shaders::{
    DepthLevel, Grid, MAX_VERTEX_ATTRIBUTES, PrimitiveEntry, Shading, Transform,
};

pub use barrier::{Barrier, BarrierBatch, ResourceState, ResourceStates};
pub use config::{
    BinningMode, CLEAR_COLOR, DEFAULT_BIN_RATIO, DEFAULT_LIST_CAPACITY, IndexFormat,
    OutputLayout, RasterConfig, TILE_SIZE, VertexAttribute, VertexFormat, Viewport,
};
pub use descriptor::{Binding, DescriptorTable, DescriptorTableBuilder};
pub use engine::{Engine, EngineLimits, ShaderDesc};
pub use indirect::{DispatchIndirectArgs, IndirectArgument, IndirectCommandLayout};
pub use pipeline::{DrawPhase, Pipeline, PipelineBuilder, Stage};
pub use recording::{
    BindType, BufferProxy, Command, ImageFormat, ImageProxy, Recording, ResourceId,
    ResourceProxy, ShaderId,
};
pub use resources::{Counters, DepthBuffer, IndexBufferView, PrimitiveLists, VertexBufferView};
pub use shaders::{ShaderSource, StageLayouts};

#[cfg(feature = "cpu")]
pub use cpu_engine::CpuEngine;
#[cfg(feature = "cpu")]
pub use engine::CpuShaderFn;
#[cfg(feature = "wgpu")]
pub use wgpu;
#[cfg(feature = "wgpu")]
pub use wgpu_engine::{ExternalResource, WgpuEngine};

pub mod low_level {
    //! Building blocks for recording work outside of a [`Pipeline`](crate::Pipeline).
    //!
    //! These are what the pipeline itself is made of, and are exported for applications that
    //! record their own dispatches around it.

    pub use compute_raster_shaders::{
        ClearColor, ClearDepth, RASTER_FLAG_DEPTH, RASTER_FLAG_THREE_LEVEL, RasterUniform,
        VertexUniform,
    };
    pub use compute_raster_shaders::{defines, names};
}

/// Errors that can occur in compute_raster.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// There is no available device with the features required by compute_raster.
    #[error("Couldn't find suitable device")]
    NoCompatibleDevice,

    /// A kernel source couldn't be read.
    #[error("Couldn't read shader source '{name}'")]
    ShaderLoad {
        name: String,
        #[source]
        source: std::io::Error,
    },
    /// A kernel imports a shared source that doesn't exist.
    #[error("Shader '{shader}' imports unknown source '{import}'")]
    UnknownImport { shader: String, import: String },
    /// A kernel source has malformed preprocessor directives.
    #[error(transparent)]
    Preprocess(compute_raster_shaders::preprocess::PreprocessError),
    /// No kernel is registered under the name.
    #[error("Shader '{0}' is missing")]
    MissingShader(String),

    /// A vertex attribute can't be described to the vertex stage.
    #[error("Vertex attribute {slot} is invalid: {reason}")]
    InvalidAttribute { slot: usize, reason: String },
    #[error("At most {max} vertex attributes are supported, {count} were configured")]
    TooManyAttributes { count: usize, max: usize },
    /// Bound descriptor tables don't match the layout a shader was created with.
    #[error("Descriptor tables don't match the layout of '{shader}': {detail}")]
    LayoutMismatch { shader: &'static str, detail: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Used a buffer inside a recording while it was not available.
    /// Check if you have created it and not freed before its last usage.
    #[error("Buffer '{0}' is not available but used for {1}")]
    UnavailableBufferUsed(&'static str, &'static str),
    /// Used an image inside a recording while it was not available.
    #[error("Image '{0}' is not available but used for {1}")]
    UnavailableImageUsed(&'static str, &'static str),
    /// A resource was used in a state that doesn't permit the use.
    #[error("'{resource}' is in {state} state but used as {usage}")]
    InvalidResourceState {
        resource: &'static str,
        state: ResourceState,
        usage: &'static str,
    },
    /// A transition started from a state the resource isn't in.
    #[error("Barrier on '{resource}' starts from {found}, but it is in {expected} state")]
    BarrierMismatch {
        resource: &'static str,
        expected: ResourceState,
        found: ResourceState,
    },
    /// A resource was accessed while unordered writes to it were unsynchronised.
    #[error("'{resource}' has unsynchronised writes but is used as {usage}")]
    MissingBarrier {
        resource: &'static str,
        usage: &'static str,
    },
    /// Downloaded a resource that no run of a recording has downloaded.
    #[error("Nothing was downloaded from '{0}'")]
    DownloadUnavailable(&'static str),

    /// Failed to async map a buffer.
    /// See [`wgpu::BufferAsyncError`] for more information.
    #[cfg(feature = "wgpu")]
    #[error("Failed to async map a buffer")]
    BufferAsyncError(#[from] wgpu::BufferAsyncError),
    #[cfg(feature = "wgpu")]
    #[error("wgpu Error from scope")]
    WgpuErrorFromScope(#[from] wgpu::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

static_assertions::assert_impl_all!(Pipeline: Send);
static_assertions::assert_impl_all!(Recording: Send);
