// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! compute_raster tests.

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
#![allow(
    missing_debug_implementations,
    unreachable_pub,
    missing_docs,
    clippy::missing_assert_message,
    clippy::allow_attributes_without_reason
)]

use anyhow::{Result, anyhow};
use compute_raster::util::RenderContext;
use compute_raster::{
    BinningMode, BufferProxy, Counters, CpuEngine, DEFAULT_LIST_CAPACITY, DepthBuffer,
    DescriptorTable, Engine, ImageProxy, OutputLayout, Pipeline, PipelineBuilder, PrimitiveEntry,
    RasterConfig, Recording, Shading, Stage, Transform, WgpuEngine,
};

mod reference;

pub use reference::{ReferenceTarget, ScreenTriangle, depth_bits, reference_pairs, unorm8};

pub const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
pub const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];

/// Initialises logging once per test binary. Set `RUST_LOG` to see pipeline logs.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct TestParams {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub mode: BinningMode,
    pub depth: bool,
    pub bin_list_capacity: u32,
}

impl TestParams {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            mode: BinningMode::TwoLevel,
            depth: false,
            bin_list_capacity: DEFAULT_LIST_CAPACITY,
        }
    }

    pub fn config(&self) -> RasterConfig {
        RasterConfig {
            mode: self.mode,
            bin_list_capacity: self.bin_list_capacity,
            ..Default::default()
        }
    }
}

/// Normalized device coordinates of pixel position `(x, y)` in a `width` by `height` target.
pub fn ndc(x: f32, y: f32, z: f32, width: u32, height: u32) -> [f32; 3] {
    [x * 2.0 / width as f32 - 1.0, 1.0 - y * 2.0 / height as f32, z]
}

/// One draw of unindexed triangles with its own transform and shading.
#[derive(Clone, Debug)]
pub struct DrawCall {
    pub vertices: Vec<[f32; 3]>,
    pub transform: Transform,
    pub shading: Shading,
}

impl DrawCall {
    pub fn flat(vertices: Vec<[f32; 3]>, color: [f32; 4]) -> Self {
        Self {
            vertices,
            transform: Transform::IDENTITY,
            shading: Shading::flat(color),
        }
    }

    /// Clip positions of every complete triangle, as the vertex stage computes them.
    pub fn clip_triangles(&self) -> Vec<[[f32; 4]; 3]> {
        let clip = |[x, y, z]: [f32; 3]| self.transform.apply([x, y, z, 1.0]);
        self.vertices
            .chunks_exact(3)
            .map(|tri| [clip(tri[0]), clip(tri[1]), clip(tri[2])])
            .collect()
    }
}

/// What a frame left in the pipeline's buffers.
#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8.
    pub pixels: Vec<u8>,
    pub depth: Option<Vec<f32>>,
    pub counters: Counters,
    /// Valid entries of the bin list.
    pub bins: Vec<PrimitiveEntry>,
    /// Valid entries of the tile list, in three-level mode.
    pub tiles: Vec<PrimitiveEntry>,
    /// Clip positions written by the last draw.
    pub positions: Vec<[f32; 4]>,
}

impl Frame {
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let ix = (y * self.width + x) as usize * 4;
        [
            self.pixels[ix],
            self.pixels[ix + 1],
            self.pixels[ix + 2],
            self.pixels[ix + 3],
        ]
    }

    pub fn depth_at(&self, x: u32, y: u32) -> Option<f32> {
        self.depth
            .as_ref()
            .map(|depth| depth[(y * self.width + x) as usize])
    }
}

/// A pipeline rendering into one color target, and optionally one depth buffer.
pub struct Harness<E> {
    pub engine: E,
    pub pipeline: Pipeline,
    pub color: ImageProxy,
    pub depth: Option<DepthBuffer>,
}

impl Harness<CpuEngine> {
    pub fn cpu(params: &TestParams) -> Result<Self> {
        Self::new(CpuEngine::new(), params)
    }
}

impl Harness<WgpuEngine> {
    pub fn gpu(params: &TestParams) -> Result<Self> {
        let mut context = RenderContext::new();
        let device_id = pollster::block_on(context.device())
            .ok_or_else(|| anyhow!("No compatible device found"))?;
        let device_handle = &context.devices[device_id];
        let engine = WgpuEngine::new(&device_handle.device, &device_handle.queue);
        Self::new(engine, params)
    }
}

impl<E: Engine> Harness<E> {
    pub fn new(mut engine: E, params: &TestParams) -> Result<Self> {
        init_logging();
        let mut recording = Recording::default();
        let mut pipeline = PipelineBuilder::new(params.config())
            .output_layout(OutputLayout {
                depth: params.depth,
            })
            .build(&mut engine, &mut recording)?;
        let color = pipeline.create_color_target(params.width, params.height);
        let depth = params
            .depth
            .then(|| pipeline.create_depth_buffer(params.width, params.height));
        pipeline.set_render_targets(color, depth);
        engine.run_recording(&recording, "compute_raster_tests.setup")?;
        Ok(Self {
            engine,
            pipeline,
            color,
            depth,
        })
    }

    /// Clears the targets, records `draws` in order and reads everything back.
    pub fn render(&mut self, draws: &[DrawCall]) -> Result<Frame> {
        let recording = self.record_frame(draws)?;
        self.engine
            .run_recording(&recording, "compute_raster_tests.frame")?;
        self.read_frame(!draws.is_empty())
    }

    /// Records a frame without running it.
    ///
    /// The recording clears the targets, draws, downloads what [`Harness::read_frame`] reads
    /// and frees the per-draw buffers through the pipeline.
    pub fn record_frame(&mut self, draws: &[DrawCall]) -> Result<Recording> {
        let mut recording = Recording::default();
        self.pipeline.clear_color(self.color, None);
        if let Some(depth) = self.depth {
            self.pipeline.clear_depth(depth, None);
        }
        let mut transient = Vec::new();
        for draw in draws {
            let num_vertices = draw.vertices.len() as u32;
            let vertices = self.pipeline.create_vertex_buffer(
                &mut recording,
                bytemuck::cast_slice(&draw.vertices),
                num_vertices,
                12,
            )?;
            transient.push(vertices.buffer);
            transient.extend(self.bind_draw_tables(&mut recording, draw)?);
            self.pipeline.set_vertex_buffer(vertices);
            self.pipeline.draw(&mut recording, num_vertices);
        }
        self.pipeline.flush_clears(&mut recording);

        let lists = self.pipeline.primitive_lists();
        recording.download_image(self.color);
        if let Some(depth) = self.depth {
            recording.download(depth.buffer);
        }
        if !draws.is_empty() {
            recording.download(lists.bin_list);
            recording.download(self.pipeline.positions());
            if let Some(tile_list) = lists.tile_list {
                recording.download(tile_list);
            }
        }
        for buf in transient {
            self.pipeline.free_buffer(&mut recording, buf);
        }
        Ok(recording)
    }

    /// Uploads the transform and shading of `draw` and binds them as the first external
    /// tables. Returns the uploaded buffers.
    pub fn bind_draw_tables(
        &mut self,
        recording: &mut Recording,
        draw: &DrawCall,
    ) -> Result<[BufferProxy; 2]> {
        let transform = recording.upload_uniform("transform", bytemuck::bytes_of(&draw.transform));
        let shading = recording.upload_uniform("shading", bytemuck::bytes_of(&draw.shading));
        self.pipeline.bind_external_table(
            Stage::Vertex,
            0,
            DescriptorTable::builder("transform")
                .uniform(transform)
                .build(),
        )?;
        self.pipeline.bind_external_table(
            Stage::Pixel,
            0,
            DescriptorTable::builder("shading").uniform(shading).build(),
        )?;
        Ok([transform, shading])
    }

    /// Reads back what a run of [`Harness::record_frame`] downloaded.
    pub fn read_frame(&mut self, has_draws: bool) -> Result<Frame> {
        let pixels = self.engine.download_image(&self.color)?;
        let depth = match self.depth {
            Some(depth) => Some(depth.pixel_depths(&self.engine.download_buffer(&depth.buffer)?)),
            None => None,
        };
        let mut frame = Frame {
            width: self.color.width,
            height: self.color.height,
            pixels,
            depth,
            counters: Counters::default(),
            bins: Vec::new(),
            tiles: Vec::new(),
            positions: Vec::new(),
        };
        if has_draws {
            let lists = self.pipeline.primitive_lists();
            frame.counters = self.pipeline.read_counters(&mut self.engine)?;
            frame.bins = self.entries(lists.bin_list, frame.counters.bins)?;
            if let (Some(tile_list), Some(tiles)) = (lists.tile_list, frame.counters.tiles) {
                frame.tiles = self.entries(tile_list, tiles)?;
            }
            let positions = self.engine.download_buffer(&self.pipeline.positions())?;
            frame.positions = bytemuck::pod_collect_to_vec(&positions);
        }
        Ok(frame)
    }

    fn entries(&mut self, list: BufferProxy, count: u32) -> Result<Vec<PrimitiveEntry>> {
        let bytes = self.engine.download_buffer(&list)?;
        let mut entries: Vec<PrimitiveEntry> = bytemuck::pod_collect_to_vec(&bytes);
        entries.truncate(count as usize);
        Ok(entries)
    }
}

/// Renders `draws` with the brute-force reference, starting from the default clear values.
pub fn reference_frame(params: &TestParams, draws: &[DrawCall]) -> ReferenceTarget {
    let config = params.config();
    let mut target = ReferenceTarget::new(
        params.width,
        params.height,
        config.clear_color.components,
        config.clear_depth,
    );
    for draw in draws {
        target.draw(&draw.clip_triangles(), draw.shading.base_color, params.depth);
    }
    target
}

/// Number of pixels that differ between two RGBA8 images.
pub fn count_differences(a: &[u8], b: &[u8]) -> usize {
    a.chunks_exact(4)
        .zip(b.chunks_exact(4))
        .filter(|(a, b)| a != b)
        .count()
}
