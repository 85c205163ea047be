// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Resource setup and per-draw recording of the raster stages.

use std::collections::HashMap;

use bytemuck::bytes_of;
use compute_raster_shaders::{
    BIN_WG, CLEAR_COLOR_WG, CLEAR_DEPTH_WG, ClearColor, ClearDepth, DepthLevel,
    DispatchIndirectArgs, MAX_VERTEX_ATTRIBUTES, PrimitiveEntry, RASTER_FLAG_DEPTH,
    RASTER_FLAG_THREE_LEVEL, RasterUniform, VERTEX_WG, VertexUniform,
};
use peniko::Color;

use crate::barrier::{ResourceState, ResourceStates};
use crate::config::{
    BinningMode, IndexFormat, OutputLayout, RasterConfig, VertexAttribute, VertexFormat, Viewport,
};
use crate::descriptor::DescriptorTable;
use crate::engine::{Engine, EngineLimits};
use crate::indirect::IndirectCommandLayout;
use crate::recording::{
    BindType, BufferProxy, ImageFormat, ImageProxy, Recording, ResourceId, ResourceProxy,
};
use crate::resources::{
    Counters, DepthBuffer, IndexBufferView, PrimitiveLists, RenderTargets, VertexBufferView,
};
use crate::shaders::{RasterShaders, StageLayouts, Variant};
use crate::{Error, Result};

/// A stage that accepts tables bound by the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Vertex,
    Pixel,
}

impl Stage {
    fn label(self) -> &'static str {
        match self {
            Self::Vertex => "vertex stage",
            Self::Pixel => "pixel stage",
        }
    }
}

/// Progress of the draw being recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DrawPhase {
    #[default]
    Idle,
    VertexDispatched,
    Binned,
    Tiled,
    PixelDispatched,
}

/// Configures and builds a [`Pipeline`].
pub struct PipelineBuilder {
    config: RasterConfig,
    attributes: Vec<(usize, VertexAttribute)>,
    output: OutputLayout,
    layouts: StageLayouts,
    max_vertices: u32,
}

impl PipelineBuilder {
    pub fn new(config: RasterConfig) -> Self {
        Self {
            config,
            attributes: Vec::new(),
            output: OutputLayout::default(),
            layouts: StageLayouts::default(),
            max_vertices: 0,
        }
    }

    /// Adds a per-vertex output in `slot`, replacing any attribute already there.
    ///
    /// Slots must be filled from zero without gaps. Attribute `i` is read from the vertex
    /// buffer right after the position and the attributes before it, and is written to its own
    /// buffer `stride` bytes per vertex.
    pub fn vertex_attribute(
        mut self,
        slot: usize,
        stride: u32,
        format: VertexFormat,
        name: &'static str,
    ) -> Self {
        let attribute = VertexAttribute {
            stride,
            format,
            name,
        };
        match self.attributes.iter_mut().find(|(s, _)| *s == slot) {
            Some((_, existing)) => *existing = attribute,
            None => self.attributes.push((slot, attribute)),
        }
        self
    }

    pub fn output_layout(mut self, output: OutputLayout) -> Self {
        self.output = output;
        self
    }

    /// Declares the layouts of the tables the application binds ahead of `stage`'s own.
    pub fn stage_layout(mut self, stage: Stage, tables: Vec<Vec<BindType>>) -> Self {
        match stage {
            Stage::Vertex => self.layouts.vertex = tables,
            Stage::Pixel => self.layouts.pixel = tables,
        }
        self
    }

    /// Initial capacity of the vertex output buffers.
    ///
    /// Creating a larger vertex or index buffer through the pipeline grows them.
    pub fn max_vertices(mut self, count: u32) -> Self {
        self.max_vertices = count;
        self
    }

    fn validated_attributes(&self) -> Result<Vec<VertexAttribute>> {
        let count = self.attributes.iter().map(|(slot, _)| slot + 1).max().unwrap_or(0);
        if count > MAX_VERTEX_ATTRIBUTES {
            return Err(Error::TooManyAttributes {
                count,
                max: MAX_VERTEX_ATTRIBUTES,
            });
        }
        let mut attributes = Vec::with_capacity(count);
        for slot in 0..count {
            let Some((_, attribute)) = self.attributes.iter().find(|(s, _)| *s == slot) else {
                return Err(Error::InvalidAttribute {
                    slot,
                    reason: "slot is empty but a later slot is used".into(),
                });
            };
            if attribute.stride % 4 != 0 {
                return Err(Error::InvalidAttribute {
                    slot,
                    reason: format!("stride {} is not a multiple of 4", attribute.stride),
                });
            }
            if attribute.stride < attribute.format.byte_size() {
                return Err(Error::InvalidAttribute {
                    slot,
                    reason: format!(
                        "stride {} is smaller than {:?}",
                        attribute.stride, attribute.format
                    ),
                });
            }
            attributes.push(*attribute);
        }
        Ok(attributes)
    }

    /// Registers the kernels with `engine` and allocates the pipeline's resources.
    ///
    /// Uploads of initial contents are recorded into `recording`, which must run before any
    /// recording with draws from the pipeline.
    pub fn build<E: Engine + ?Sized>(
        self,
        engine: &mut E,
        recording: &mut Recording,
    ) -> Result<Pipeline> {
        self.config.validate()?;
        let attributes = self.validated_attributes()?;
        let limits = engine.limits();
        let three_level = self.config.mode == BinningMode::ThreeLevel;
        let variant = Variant {
            three_level,
            depth: self.output.depth,
            num_attributes: attributes.len(),
        };
        let shaders =
            RasterShaders::new(engine, &self.config.shader_source, &self.layouts, variant)?;

        let entry_size = size_of::<PrimitiveEntry>() as u64;
        let bin_capacity = clamp_capacity("bin", self.config.bin_list_capacity, &limits);
        let tile_capacity = if three_level {
            clamp_capacity("tile", self.config.tile_list_capacity, &limits)
        } else {
            0
        };
        let indirect = IndirectCommandLayout::DISPATCH;
        let counter_size = indirect.stride();
        let bin_counter = BufferProxy::new(counter_size, "compute_raster.bin_counter");
        indirect.check(&bin_counter)?;
        let lists = PrimitiveLists {
            bin_counter,
            bin_list: BufferProxy::new(u64::from(bin_capacity) * entry_size, "compute_raster.bin_list"),
            tile_counter: three_level
                .then(|| BufferProxy::new(counter_size, "compute_raster.tile_counter")),
            tile_list: three_level.then(|| {
                BufferProxy::new(u64::from(tile_capacity) * entry_size, "compute_raster.tile_list")
            }),
        };
        let reset = recording.upload(
            "compute_raster.counter_reset",
            bytes_of(&DispatchIndirectArgs::RESET),
        );
        let uniforms = Uniforms {
            vertex: recording
                .upload_uniform("compute_raster.vertex_uniform", bytes_of(&VertexUniform::default())),
            raster: recording
                .upload_uniform("compute_raster.raster_uniform", bytes_of(&RasterUniform::default())),
            clear_color: recording
                .upload_uniform("compute_raster.clear_color", bytes_of(&ClearColor::default())),
            clear_depth: recording
                .upload_uniform("compute_raster.clear_depth", bytes_of(&ClearDepth::default())),
        };
        let outputs = VertexOutputs::new(
            clamp_vertices(self.max_vertices, &attributes, &limits),
            &attributes,
        );
        log::info!(
            "compute_raster pipeline: {:?}, tile {} bin {}, bin list {} tile list {}, {} vertices, \
             {} attributes, depth {}, shaders {:?}",
            self.config.mode,
            self.config.tile_size,
            self.config.bin_size(),
            bin_capacity,
            tile_capacity,
            outputs.capacity,
            attributes.len(),
            self.output.depth,
            self.config.shader_source,
        );
        let external = ExternalTables {
            vertex: vec![None; self.layouts.vertex.len()],
            pixel: vec![None; self.layouts.pixel.len()],
        };
        Ok(Pipeline {
            config: self.config,
            attributes,
            output: self.output,
            layouts: self.layouts,
            limits,
            shaders,
            indirect,
            states: ResourceStates::default(),
            uniforms,
            outputs,
            reset,
            lists,
            bin_capacity,
            tile_capacity,
            vertex_buffer: None,
            index_buffer: None,
            targets: None,
            viewport: None,
            external,
            tables: TableCache::default(),
            clears: Vec::new(),
            phase: DrawPhase::Idle,
        })
    }
}

/// Largest list capacity both the binding size and the dispatch dimension limits allow.
fn clamp_capacity(list: &str, requested: u32, limits: &EngineLimits) -> u32 {
    let entry_size = size_of::<PrimitiveEntry>() as u32;
    let max = (limits.max_storage_buffer_binding_size / entry_size)
        .min(limits.max_compute_workgroups_per_dimension);
    if requested > max {
        log::warn!("{list} list capacity {requested} exceeds engine limits, clamped to {max}");
        max
    } else {
        requested
    }
}

fn clamp_vertices(requested: u32, attributes: &[VertexAttribute], limits: &EngineLimits) -> u32 {
    let widest = attributes
        .iter()
        .map(|a| a.stride)
        .chain([size_of::<[f32; 4]>() as u32])
        .max()
        .unwrap_or(16);
    let max = (limits.max_storage_buffer_binding_size / widest)
        .min(limits.max_compute_workgroups_per_dimension.saturating_mul(VERTEX_WG));
    if requested > max {
        log::warn!("vertex capacity {requested} exceeds engine limits, clamped to {max}");
        max
    } else {
        requested
    }
}

/// Persistent uniform buffers, rewritten in command order before each use.
#[derive(Clone, Copy, Debug)]
struct Uniforms {
    vertex: BufferProxy,
    raster: BufferProxy,
    clear_color: BufferProxy,
    clear_depth: BufferProxy,
}

/// Clip positions and attributes written by the vertex stage.
#[derive(Clone, Debug)]
struct VertexOutputs {
    positions: BufferProxy,
    attribs: Vec<BufferProxy>,
    capacity: u32,
}

impl VertexOutputs {
    fn new(capacity: u32, attributes: &[VertexAttribute]) -> Self {
        // Bindings can't be empty.
        let slots = u64::from(capacity.max(1));
        Self {
            positions: BufferProxy::new(slots * 16, "compute_raster.positions"),
            attribs: attributes
                .iter()
                .map(|a| BufferProxy::new(slots * u64::from(a.stride), a.name))
                .collect(),
            capacity,
        }
    }

    fn free(&self, recording: &mut Recording, states: &mut ResourceStates) {
        for buf in std::iter::once(&self.positions).chain(&self.attribs) {
            recording.free_buffer(*buf);
            states.forget(buf.id);
        }
    }
}

#[derive(Clone, Debug, Default)]
struct ExternalTables {
    vertex: Vec<Option<DescriptorTable>>,
    pixel: Vec<Option<DescriptorTable>>,
}

/// Tables of the pipeline's own resources, rebuilt only when a member changes.
#[derive(Default)]
struct TableCache {
    vertex: Option<DescriptorTable>,
    vertex_indexed: Option<DescriptorTable>,
    attribs: Option<DescriptorTable>,
    bin: Option<DescriptorTable>,
    tile: Option<DescriptorTable>,
    pixel: Option<DescriptorTable>,
    pixel_depth: Option<DescriptorTable>,
    pixel_attribs: Option<DescriptorTable>,
    clear_color: HashMap<ResourceId, DescriptorTable>,
    clear_depth: HashMap<ResourceId, DescriptorTable>,
}

impl TableCache {
    fn invalidate_vertex_outputs(&mut self) {
        self.vertex = None;
        self.vertex_indexed = None;
        self.attribs = None;
        self.invalidate_targets();
        self.pixel_attribs = None;
    }

    fn invalidate_targets(&mut self) {
        self.bin = None;
        self.tile = None;
        self.pixel = None;
        self.pixel_depth = None;
    }
}

#[derive(Clone, Copy, Debug)]
enum PendingClear {
    Color { target: ImageProxy, color: [f32; 4] },
    Depth { depth: DepthBuffer, value: f32 },
}

/// The compute rasterization pipeline.
///
/// Owns the intermediate buffers and records draws into [`Recording`]s. Build one with
/// [`PipelineBuilder`].
pub struct Pipeline {
    config: RasterConfig,
    attributes: Vec<VertexAttribute>,
    output: OutputLayout,
    layouts: StageLayouts,
    limits: EngineLimits,
    shaders: RasterShaders,
    indirect: IndirectCommandLayout,
    states: ResourceStates,
    uniforms: Uniforms,
    outputs: VertexOutputs,
    reset: BufferProxy,
    lists: PrimitiveLists,
    bin_capacity: u32,
    tile_capacity: u32,
    vertex_buffer: Option<VertexBufferView>,
    index_buffer: Option<IndexBufferView>,
    targets: Option<RenderTargets>,
    viewport: Option<Viewport>,
    external: ExternalTables,
    tables: TableCache,
    clears: Vec<PendingClear>,
    phase: DrawPhase,
}

impl Pipeline {
    pub fn config(&self) -> &RasterConfig {
        &self.config
    }

    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.attributes
    }

    pub fn phase(&self) -> DrawPhase {
        self.phase
    }

    /// Number of vertices (or indices) a single draw can process.
    pub fn vertex_capacity(&self) -> u32 {
        self.outputs.capacity
    }

    /// The viewport of the next draw. Defaults to the whole color target.
    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    /// Read-only views of the primitive counters and lists.
    pub fn primitive_lists(&self) -> PrimitiveLists {
        self.lists
    }

    /// The clip position buffer written by the vertex stage, one `vec4<f32>` per output slot.
    pub fn positions(&self) -> BufferProxy {
        self.outputs.positions
    }

    /// The output buffer of each attribute.
    pub fn attribute_buffers(&self) -> &[BufferProxy] {
        &self.outputs.attribs
    }

    /// Recorder-side resource states, for inspecting the barriers a recording will need.
    pub fn resource_states(&self) -> &ResourceStates {
        &self.states
    }

    /// Uploads `num_vertices` vertices of `stride` bytes.
    ///
    /// A vertex starts with its position as three `f32`s, followed by each attribute's
    /// components in slot order.
    pub fn create_vertex_buffer(
        &mut self,
        recording: &mut Recording,
        data: &[u8],
        num_vertices: u32,
        stride: u32,
    ) -> Result<VertexBufferView> {
        let words = 3 + self
            .attributes
            .iter()
            .map(|a| a.format.components())
            .sum::<u32>();
        if stride % 4 != 0 || stride < words * 4 {
            return Err(Error::InvalidConfig(format!(
                "vertex stride {stride} can't hold {words} words"
            )));
        }
        let size = u64::from(num_vertices) * u64::from(stride);
        if (data.len() as u64) < size {
            return Err(Error::InvalidConfig(format!(
                "{} bytes of vertex data for {num_vertices} vertices of {stride} bytes",
                data.len()
            )));
        }
        let mut bytes = data[..size as usize].to_vec();
        // Bindings can't be empty.
        bytes.resize(bytes.len().max(4), 0);
        let buffer = recording.upload("compute_raster.vertices", bytes);
        self.reserve_vertices(recording, num_vertices);
        Ok(VertexBufferView {
            buffer,
            num_vertices,
            stride,
        })
    }

    /// Uploads `num_indices` indices of `format`.
    pub fn create_index_buffer(
        &mut self,
        recording: &mut Recording,
        data: &[u8],
        num_indices: u32,
        format: IndexFormat,
    ) -> Result<IndexBufferView> {
        let size = u64::from(num_indices) * u64::from(format.byte_size());
        if (data.len() as u64) < size {
            return Err(Error::InvalidConfig(format!(
                "{} bytes of index data for {num_indices} {format:?} indices",
                data.len()
            )));
        }
        // Kernels load indices a word at a time.
        let mut bytes = data[..size as usize].to_vec();
        bytes.resize(bytes.len().next_multiple_of(4).max(4), 0);
        let buffer = recording.upload("compute_raster.indices", bytes);
        self.reserve_vertices(recording, num_indices);
        Ok(IndexBufferView {
            buffer,
            num_indices,
            format,
        })
    }

    /// A color target the pipeline can write. It is created on first use.
    pub fn create_color_target(&self, width: u32, height: u32) -> ImageProxy {
        ImageProxy::new(width, height, ImageFormat::Rgba8, "compute_raster.color")
    }

    /// A depth buffer with the hierarchy levels of this pipeline's binning mode.
    ///
    /// A clear to the configured clear depth is queued for it.
    pub fn create_depth_buffer(&mut self, width: u32, height: u32) -> DepthBuffer {
        let tile_size =
            (self.config.mode == BinningMode::ThreeLevel).then_some(self.config.tile_size);
        let ([pixel, tile, bin], words) =
            DepthBuffer::levels(width, height, tile_size, self.config.bin_size());
        let depth = DepthBuffer {
            buffer: BufferProxy::new(u64::from(words) * 4, "compute_raster.depth"),
            pixel,
            tile,
            bin,
        };
        self.clear_depth(depth, None);
        depth
    }

    /// Grows the vertex output buffers to hold `count` slots.
    fn reserve_vertices(&mut self, recording: &mut Recording, count: u32) {
        if count <= self.outputs.capacity {
            return;
        }
        let capacity = clamp_vertices(count, &self.attributes, &self.limits);
        if capacity <= self.outputs.capacity {
            return;
        }
        log::debug!(
            "growing vertex outputs from {} to {capacity}",
            self.outputs.capacity
        );
        let old = std::mem::replace(
            &mut self.outputs,
            VertexOutputs::new(capacity, &self.attributes),
        );
        old.free(recording, &mut self.states);
        self.tables.invalidate_vertex_outputs();
    }

    pub fn set_vertex_buffer(&mut self, view: VertexBufferView) {
        if self.vertex_buffer.is_some_and(|v| v.buffer == view.buffer) {
            self.vertex_buffer = Some(view);
            return;
        }
        self.vertex_buffer = Some(view);
        self.tables.vertex = None;
        self.tables.vertex_indexed = None;
    }

    pub fn set_index_buffer(&mut self, view: IndexBufferView) {
        if self.index_buffer.is_some_and(|v| v.buffer == view.buffer) {
            self.index_buffer = Some(view);
            return;
        }
        self.index_buffer = Some(view);
        self.tables.vertex_indexed = None;
    }

    /// Sets the targets of the following draws.
    ///
    /// `depth` is required when the output layout has depth, and ignored otherwise.
    pub fn set_render_targets(&mut self, color: ImageProxy, depth: Option<DepthBuffer>) {
        let depth = if self.output.depth {
            debug_assert!(depth.is_some(), "output layout has depth but no depth buffer was set");
            depth
        } else {
            None
        };
        let targets = RenderTargets { color, depth };
        if self.targets != Some(targets) {
            self.targets = Some(targets);
            self.tables.invalidate_targets();
        }
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
    }

    /// Binds `table` as the `slot`th table ahead of `stage`'s own tables.
    pub fn bind_external_table(
        &mut self,
        stage: Stage,
        slot: usize,
        table: DescriptorTable,
    ) -> Result<()> {
        let (layout, tables) = match stage {
            Stage::Vertex => (&self.layouts.vertex, &mut self.external.vertex),
            Stage::Pixel => (&self.layouts.pixel, &mut self.external.pixel),
        };
        let Some(expected) = layout.get(slot) else {
            return Err(Error::InvalidConfig(format!(
                "the {} takes {} external tables, slot {slot} is out of range",
                stage.label(),
                layout.len()
            )));
        };
        if !table.matches_layout(expected) {
            return Err(Error::LayoutMismatch {
                shader: stage.label(),
                detail: format!(
                    "external table {slot} ({}) is {:?}, declared {expected:?}",
                    table.label(),
                    table.layout().collect::<Vec<_>>()
                ),
            });
        }
        tables[slot] = Some(table);
        Ok(())
    }

    /// Queues a clear of `target`, to `color` or the configured clear color.
    ///
    /// Color clears run right before the next pixel stage, or on [`flush_clears`](Self::flush_clears).
    pub fn clear_color(&mut self, target: ImageProxy, color: Option<Color>) {
        let color = color.unwrap_or(self.config.clear_color).components;
        self.clears.retain(
            |c| !matches!(c, PendingClear::Color { target: t, .. } if t.id == target.id),
        );
        self.clears.push(PendingClear::Color { target, color });
    }

    /// Queues a clear of every level of `depth`, to `value` or the configured clear depth.
    ///
    /// Depth clears run right before the next binning stage, or on
    /// [`flush_clears`](Self::flush_clears).
    pub fn clear_depth(&mut self, depth: DepthBuffer, value: Option<f32>) {
        let value = value.unwrap_or(self.config.clear_depth);
        self.clears.retain(
            |c| !matches!(c, PendingClear::Depth { depth: d, .. } if d.buffer.id == depth.buffer.id),
        );
        self.clears.push(PendingClear::Depth { depth, value });
    }

    /// Records every queued clear, for frames without draws.
    pub fn flush_clears(&mut self, recording: &mut Recording) {
        self.flush_depth_clears(recording);
        self.flush_color_clears(recording);
    }

    fn flush_depth_clears(&mut self, recording: &mut Recording) {
        let mut remaining = Vec::with_capacity(self.clears.len());
        for clear in std::mem::take(&mut self.clears) {
            let PendingClear::Depth { depth, value } = clear else {
                remaining.push(clear);
                continue;
            };
            let words = depth.words();
            let params = ClearDepth {
                // Depths are stored without a sign so `-0.0` orders like `0.0`.
                value: value.to_bits() & 0x7fff_ffff,
                count: words,
                _padding: [0; 2],
            };
            recording.write(self.uniforms.clear_depth, 0, bytes_of(&params));
            let uniform = self.uniforms.clear_depth;
            let table = self
                .tables
                .clear_depth
                .entry(depth.buffer.id)
                .or_insert_with(|| {
                    DescriptorTable::builder("compute_raster.clear_depth")
                        .uniform(uniform)
                        .read_write(depth.buffer)
                        .build()
                })
                .clone();
            let mut batch = self.states.batch();
            batch.bind_table(&table);
            batch.submit(recording);
            let workgroups = words
                .div_ceil(CLEAR_DEPTH_WG)
                .clamp(1, self.limits.max_compute_workgroups_per_dimension);
            recording.dispatch(self.shaders.clear_depth, (workgroups, 1, 1), [table.clone()]);
            self.states.mark_dispatch(std::slice::from_ref(&table));
        }
        self.clears = remaining;
    }

    fn flush_color_clears(&mut self, recording: &mut Recording) {
        let mut remaining = Vec::with_capacity(self.clears.len());
        for clear in std::mem::take(&mut self.clears) {
            let PendingClear::Color { target, color } = clear else {
                remaining.push(clear);
                continue;
            };
            recording.write(self.uniforms.clear_color, 0, bytes_of(&ClearColor { color }));
            let uniform = self.uniforms.clear_color;
            let table = self
                .tables
                .clear_color
                .entry(target.id)
                .or_insert_with(|| {
                    DescriptorTable::builder("compute_raster.clear_color")
                        .uniform(uniform)
                        .bind(BindType::Image(ImageFormat::Rgba8), target)
                        .build()
                })
                .clone();
            let mut batch = self.states.batch();
            batch.bind_table(&table);
            batch.submit(recording);
            let (wg_x, wg_y) = CLEAR_COLOR_WG;
            recording.dispatch(
                self.shaders.clear_color,
                (target.width.div_ceil(wg_x), target.height.div_ceil(wg_y), 1),
                [table.clone()],
            );
            self.states.mark_dispatch(std::slice::from_ref(&table));
        }
        self.clears = remaining;
    }

    /// Records a draw of `num_vertices` vertices, three per triangle.
    pub fn draw(&mut self, recording: &mut Recording, num_vertices: u32) {
        self.record_draw(recording, num_vertices, false);
    }

    /// Records a draw of `num_indices` indexed vertices, three per triangle.
    pub fn draw_indexed(&mut self, recording: &mut Recording, num_indices: u32) {
        self.record_draw(recording, num_indices, true);
    }

    fn record_draw(&mut self, recording: &mut Recording, count: u32, indexed: bool) {
        debug_assert_eq!(self.phase, DrawPhase::Idle, "draws are recorded one at a time");
        let Some(targets) = self.targets else {
            log::warn!("draw skipped: no render targets are set");
            return;
        };
        let Some(vertex_buffer) = self.vertex_buffer else {
            log::warn!("draw skipped: no vertex buffer is set");
            return;
        };
        let index_buffer = match (indexed, self.index_buffer) {
            (false, _) => None,
            (true, Some(index_buffer)) => Some(index_buffer),
            (true, None) => {
                log::warn!("indexed draw skipped: no index buffer is set");
                return;
            }
        };
        let depth = targets.depth.filter(|_| self.output.depth);
        if self.output.depth && depth.is_none() {
            log::warn!("draw skipped: the output layout has depth but no depth buffer is set");
            return;
        }
        let Some(vertex_external) = complete(&self.external.vertex, Stage::Vertex) else {
            return;
        };
        let Some(pixel_external) = complete(&self.external.pixel, Stage::Pixel) else {
            return;
        };
        debug_assert!(
            count <= self.outputs.capacity,
            "draw of {count} exceeds vertex capacity {}",
            self.outputs.capacity
        );
        let count = count.min(self.outputs.capacity);
        let viewport = self
            .viewport
            .unwrap_or_else(|| Viewport::new(targets.color.width, targets.color.height));
        let num_triangles = count / 3;

        let vertex_uniform = self.vertex_uniform(count, &vertex_buffer, index_buffer.as_ref());
        recording.write(self.uniforms.vertex, 0, bytes_of(&vertex_uniform));
        let raster_uniform = self.raster_uniform(&viewport, num_triangles, depth.as_ref());
        recording.write(self.uniforms.raster, 0, bytes_of(&raster_uniform));

        self.vertex_stage(recording, count, vertex_external, &vertex_buffer, index_buffer);
        self.reset_counters(recording);
        // Binning reads the hierarchical depth, so depth clears must land first.
        self.flush_depth_clears(recording);
        self.bin_stage(recording, num_triangles, depth.as_ref());
        if self.config.mode == BinningMode::ThreeLevel {
            self.tile_stage(recording, depth.as_ref());
        }
        self.flush_color_clears(recording);
        self.pixel_stage(recording, pixel_external, &targets, depth.as_ref());
        self.advance(DrawPhase::PixelDispatched, DrawPhase::Idle);
    }

    fn advance(&mut self, from: DrawPhase, to: DrawPhase) {
        debug_assert_eq!(self.phase, from, "draw stages recorded out of order");
        self.phase = to;
    }

    fn vertex_uniform(
        &self,
        count: u32,
        vertex_buffer: &VertexBufferView,
        index_buffer: Option<&IndexBufferView>,
    ) -> VertexUniform {
        let mut uniform = VertexUniform {
            count,
            vertex_stride: vertex_buffer.stride / 4,
            num_attributes: self.attributes.len() as u32,
            index_u16: u32::from(index_buffer.is_some_and(|ib| ib.format == IndexFormat::Uint16)),
            ..Default::default()
        };
        let mut offset = 3;
        for (i, attribute) in self.attributes.iter().enumerate() {
            uniform.attrib_offset[i] = offset;
            uniform.attrib_components[i] = attribute.format.components();
            uniform.attrib_stride[i] = attribute.stride / 4;
            offset += attribute.format.components();
        }
        uniform
    }

    fn raster_uniform(
        &self,
        viewport: &Viewport,
        num_triangles: u32,
        depth: Option<&DepthBuffer>,
    ) -> RasterUniform {
        let (bin, tile) = self
            .config
            .grids(viewport, self.bin_capacity, self.tile_capacity);
        let mut flags = 0;
        if self.config.mode == BinningMode::ThreeLevel {
            flags |= RASTER_FLAG_THREE_LEVEL;
        }
        if depth.is_some() {
            flags |= RASTER_FLAG_DEPTH;
        }
        let levels = depth.map_or([DepthLevel::default(); 3], |d| [d.pixel, d.tile, d.bin]);
        let mut uniform = RasterUniform {
            viewport: viewport.to_array(),
            num_triangles,
            flags,
            bin,
            tile,
            pixel_z: levels[0],
            tile_z: levels[1],
            bin_z: levels[2],
            ..Default::default()
        };
        for (i, attribute) in self.attributes.iter().enumerate() {
            uniform.attrib_stride[i] = attribute.stride / 4;
            uniform.attrib_components[i] = attribute.format.components();
        }
        uniform
    }

    fn vertex_stage(
        &mut self,
        recording: &mut Recording,
        count: u32,
        mut tables: Vec<DescriptorTable>,
        vertex_buffer: &VertexBufferView,
        index_buffer: Option<IndexBufferView>,
    ) {
        let uniform = self.uniforms.vertex;
        let positions = self.outputs.positions;
        let (shader, internal) = match index_buffer {
            None => (
                self.shaders.vs_stage,
                self.tables
                    .vertex
                    .get_or_insert_with(|| {
                        log::debug!("building vertex table");
                        DescriptorTable::builder("compute_raster.vertex")
                            .uniform(uniform)
                            .read_only(vertex_buffer.buffer)
                            .read_write(positions)
                            .build()
                    })
                    .clone(),
            ),
            Some(index_buffer) => (
                match index_buffer.format {
                    IndexFormat::Uint16 => self.shaders.vs_stage_indexed_u16,
                    IndexFormat::Uint32 => self.shaders.vs_stage_indexed_u32,
                },
                self.tables
                    .vertex_indexed
                    .get_or_insert_with(|| {
                        log::debug!("building indexed vertex table");
                        DescriptorTable::builder("compute_raster.vertex_indexed")
                            .uniform(uniform)
                            .read_only(vertex_buffer.buffer)
                            .read_only(index_buffer.buffer)
                            .read_write(positions)
                            .build()
                    })
                    .clone(),
            ),
        };
        tables.push(internal);
        if let Some(attribs) = self.attrib_table() {
            tables.push(attribs);
        }
        let mut batch = self.states.batch();
        for table in &tables {
            batch.bind_table(table);
        }
        batch.submit(recording);
        recording.dispatch(shader, (count.div_ceil(VERTEX_WG), 1, 1), tables.clone());
        self.states.mark_dispatch(&tables);
        self.advance(DrawPhase::Idle, DrawPhase::VertexDispatched);
    }

    fn attrib_table(&mut self) -> Option<DescriptorTable> {
        if self.outputs.attribs.is_empty() {
            return None;
        }
        let attribs = &self.outputs.attribs;
        let table = self.tables.attribs.get_or_insert_with(|| {
            attribs
                .iter()
                .fold(DescriptorTable::builder("compute_raster.vertex_attribs"), |b, buf| {
                    b.read_write(*buf)
                })
                .build()
        });
        Some(table.clone())
    }

    /// Resets the counters to `{0, 1, 1}` by copying from the reset buffer.
    fn reset_counters(&mut self, recording: &mut Recording) {
        let counters: Vec<BufferProxy> = std::iter::once(self.lists.bin_counter)
            .chain(self.lists.tile_counter)
            .collect();
        let mut batch = self.states.batch();
        batch.transition(self.reset, ResourceState::CopySource);
        for counter in &counters {
            batch.transition(*counter, ResourceState::CopyDest);
        }
        batch.submit(recording);
        for counter in counters {
            recording.copy_buffer(self.reset, 0, counter, 0, self.indirect.stride());
            self.states.mark_written(counter);
        }
    }

    fn bin_stage(&mut self, recording: &mut Recording, num_triangles: u32, depth: Option<&DepthBuffer>) {
        let (uniform, positions, lists) =
            (self.uniforms.raster, self.outputs.positions, self.lists);
        let table = self
            .tables
            .bin
            .get_or_insert_with(|| {
                log::debug!("building bin table");
                let mut builder = DescriptorTable::builder("compute_raster.bin")
                    .uniform(uniform)
                    .read_only(positions)
                    .read_write(lists.bin_counter)
                    .read_write(lists.bin_list);
                if let Some(depth) = depth {
                    builder = builder.read_write(depth.buffer);
                }
                builder.build()
            })
            .clone();
        let mut batch = self.states.batch();
        batch.bind_table(&table);
        batch.submit(recording);
        recording.dispatch(
            self.shaders.bin_raster,
            (num_triangles.div_ceil(BIN_WG), 1, 1),
            [table.clone()],
        );
        self.states.mark_dispatch(std::slice::from_ref(&table));
        self.advance(DrawPhase::VertexDispatched, DrawPhase::Binned);
    }

    fn tile_stage(&mut self, recording: &mut Recording, depth: Option<&DepthBuffer>) {
        let (Some(shader), Some(tile_counter), Some(tile_list)) = (
            self.shaders.tile_raster,
            self.lists.tile_counter,
            self.lists.tile_list,
        ) else {
            return;
        };
        let (uniform, positions, bin_list) =
            (self.uniforms.raster, self.outputs.positions, self.lists.bin_list);
        let table = self
            .tables
            .tile
            .get_or_insert_with(|| {
                log::debug!("building tile table");
                let mut builder = DescriptorTable::builder("compute_raster.tile")
                    .uniform(uniform)
                    .read_only(positions)
                    .read_only(bin_list)
                    .read_write(tile_counter)
                    .read_write(tile_list);
                if let Some(depth) = depth {
                    builder = builder.read_write(depth.buffer);
                }
                builder.build()
            })
            .clone();
        let mut batch = self.states.batch();
        batch.transition(self.lists.bin_counter, ResourceState::IndirectArgument);
        batch.bind_table(&table);
        batch.submit(recording);
        self.indirect
            .record(recording, shader, self.lists.bin_counter, [table.clone()]);
        self.states.mark_dispatch(std::slice::from_ref(&table));
        self.advance(DrawPhase::Binned, DrawPhase::Tiled);
    }

    /// The counter and list the pixel stage consumes.
    fn finest_list(&self) -> (BufferProxy, BufferProxy) {
        match (self.lists.tile_counter, self.lists.tile_list) {
            (Some(counter), Some(list)) => (counter, list),
            _ => (self.lists.bin_counter, self.lists.bin_list),
        }
    }

    fn pixel_stage(
        &mut self,
        recording: &mut Recording,
        external: Vec<DescriptorTable>,
        targets: &RenderTargets,
        depth: Option<&DepthBuffer>,
    ) {
        let (counter, list) = self.finest_list();
        let (uniform, positions) = (self.uniforms.raster, self.outputs.positions);
        let pixel = self
            .tables
            .pixel
            .get_or_insert_with(|| {
                log::debug!("building pixel table");
                let mut builder = DescriptorTable::builder("compute_raster.pixel")
                    .uniform(uniform)
                    .read_only(positions)
                    .read_only(list)
                    .bind(BindType::Image(ImageFormat::Rgba8), targets.color);
                if let Some(depth) = depth {
                    builder = builder.read_write(depth.buffer);
                }
                builder.build()
            })
            .clone();
        let pixel_depth = depth.map(|depth| {
            self.tables
                .pixel_depth
                .get_or_insert_with(|| {
                    DescriptorTable::builder("compute_raster.pixel_depth")
                        .uniform(uniform)
                        .read_only(positions)
                        .read_only(list)
                        .read_write(depth.buffer)
                        .build()
                })
                .clone()
        });
        let mut tables = external.clone();
        tables.push(pixel);
        if let Some(normals) = self.outputs.attribs.first().copied() {
            let table = self.tables.pixel_attribs.get_or_insert_with(|| {
                DescriptorTable::builder("compute_raster.pixel_attribs")
                    .read_only(normals)
                    .build()
            });
            tables.push(table.clone());
        }

        let mut batch = self.states.batch();
        batch.transition(counter, ResourceState::IndirectArgument);
        for table in &tables {
            batch.bind_table(table);
        }
        batch.submit(recording);

        if let (Some(shader), Some(depth_table), Some(depth)) =
            (self.shaders.pixel_depth, pixel_depth, depth)
        {
            let mut depth_tables = external;
            depth_tables.push(depth_table);
            self.indirect
                .record(recording, shader, counter, depth_tables.clone());
            self.states.mark_dispatch(&depth_tables);
            // Shading compares against the resolved depth, so every depth write must land first.
            let mut batch = self.states.batch();
            batch.uav(depth.buffer);
            batch.submit(recording);
        }
        self.indirect
            .record(recording, self.shaders.pixel_raster, counter, tables.clone());
        self.states.mark_dispatch(&tables);
        let previous = match self.config.mode {
            BinningMode::TwoLevel => DrawPhase::Binned,
            BinningMode::ThreeLevel => DrawPhase::Tiled,
        };
        self.advance(previous, DrawPhase::PixelDispatched);
    }

    /// Downloads the counters of the latest draw.
    ///
    /// Runs its own recording and blocks until the engine has the result.
    pub fn read_counters<E: Engine + ?Sized>(&mut self, engine: &mut E) -> Result<Counters> {
        let mut recording = Recording::default();
        recording.download(self.lists.bin_counter);
        if let Some(tile_counter) = self.lists.tile_counter {
            recording.download(tile_counter);
        }
        engine.run_recording(&recording, "compute_raster.read_counters")?;
        let read = |engine: &mut E, counter: &BufferProxy| -> Result<u32> {
            let bytes = engine.download_buffer(counter)?;
            let args_size = size_of::<DispatchIndirectArgs>();
            if bytes.len() < args_size {
                return Err(Error::DownloadUnavailable(counter.name));
            }
            let args: DispatchIndirectArgs = bytemuck::pod_read_unaligned(&bytes[..args_size]);
            Ok(args.x)
        };
        let bins = read(&mut *engine, &self.lists.bin_counter)?;
        if bins >= self.bin_capacity {
            log::warn!("bin list is full ({bins} entries); geometry may be missing");
        }
        let tiles = match self.lists.tile_counter {
            Some(counter) => {
                let tiles = read(&mut *engine, &counter)?;
                if tiles >= self.tile_capacity {
                    log::warn!("tile list is full ({tiles} entries); geometry may be missing");
                }
                Some(tiles)
            }
            None => None,
        };
        Ok(Counters { bins, tiles })
    }

    /// Records freeing `buf` and drops what the pipeline tracks about it.
    ///
    /// Use this rather than [`Recording::free_buffer`] for vertex, index, depth and external
    /// table buffers the pipeline has seen, so its state does not grow from frame to frame.
    pub fn free_buffer(&mut self, recording: &mut Recording, buf: BufferProxy) {
        self.forget(buf.into());
        recording.free_buffer(buf);
    }

    /// Records freeing `image` and drops what the pipeline tracks about it.
    pub fn free_image(&mut self, recording: &mut Recording, image: ImageProxy) {
        self.forget(image.into());
        recording.free_image(image);
    }

    /// Drops every state, cached table, pending clear and binding that refers to `resource`.
    ///
    /// For resources freed some other way. Bindings that referred to it must be set again
    /// before the next draw.
    pub fn forget(&mut self, resource: ResourceProxy) {
        let id = resource.id();
        self.states.forget(id);
        self.tables.clear_color.remove(&id);
        self.tables.clear_depth.remove(&id);
        self.clears.retain(|clear| match clear {
            PendingClear::Color { target, .. } => target.id != id,
            PendingClear::Depth { depth, .. } => depth.buffer.id != id,
        });
        if self.vertex_buffer.is_some_and(|v| v.buffer.id == id) {
            self.vertex_buffer = None;
            self.tables.vertex = None;
            self.tables.vertex_indexed = None;
        }
        if self.index_buffer.is_some_and(|v| v.buffer.id == id) {
            self.index_buffer = None;
            self.tables.vertex_indexed = None;
        }
        if self
            .targets
            .is_some_and(|t| t.color.id == id || t.depth.is_some_and(|d| d.buffer.id == id))
        {
            self.targets = None;
            self.tables.invalidate_targets();
        }
        for table in self
            .external
            .vertex
            .iter_mut()
            .chain(self.external.pixel.iter_mut())
        {
            if table.as_ref().is_some_and(|t| t.references(id)) {
                *table = None;
            }
        }
    }

    /// Frees every resource the pipeline owns.
    ///
    /// Vertex buffers, index buffers and render targets belong to the application.
    pub fn release(self, recording: &mut Recording) {
        let Uniforms {
            vertex,
            raster,
            clear_color,
            clear_depth,
        } = self.uniforms;
        let lists = [
            Some(self.lists.bin_counter),
            Some(self.lists.bin_list),
            self.lists.tile_counter,
            self.lists.tile_list,
        ];
        for buf in [vertex, raster, clear_color, clear_depth, self.reset]
            .into_iter()
            .chain(lists.into_iter().flatten())
            .chain(std::iter::once(self.outputs.positions))
            .chain(self.outputs.attribs.iter().copied())
        {
            recording.free_buffer(buf);
        }
    }
}

/// The external tables of `stage`, if every slot is bound.
fn complete(tables: &[Option<DescriptorTable>], stage: Stage) -> Option<Vec<DescriptorTable>> {
    let mut bound = Vec::with_capacity(tables.len());
    for (slot, table) in tables.iter().enumerate() {
        let Some(table) = table else {
            log::warn!("draw skipped: external table {slot} of the {} is not bound", stage.label());
            return None;
        };
        bound.push(table.clone());
    }
    Some(bound)
}
