// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::borrow::Cow;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;

use wgpu::util::DeviceExt;
use wgpu::{
    BindGroup, BindGroupLayout, Buffer, BufferUsages, CommandEncoder, CommandEncoderDescriptor,
    ComputePassDescriptor, ComputePipeline, Device, PipelineCompilationOptions, Queue, Texture,
    TextureAspect, TextureUsages, TextureView, TextureViewDimension,
};

use crate::descriptor::DescriptorTable;
use crate::engine::{Engine, EngineLimits, ProtocolValidator, ShaderDesc, check_layout};
use crate::recording::{
    BindType, BufferProxy, Command, ImageProxy, Recording, ResourceId, ResourceProxy, ShaderId,
};
use crate::util::block_on_wgpu;
use crate::{Error, Result};

/// Usages of every buffer the engine creates for a proxy, apart from uniform uploads.
const STORAGE_USAGE: BufferUsages = BufferUsages::STORAGE
    .union(BufferUsages::UNIFORM)
    .union(BufferUsages::INDIRECT)
    .union(BufferUsages::COPY_SRC)
    .union(BufferUsages::COPY_DST);

const UNIFORM_USAGE: BufferUsages = BufferUsages::UNIFORM.union(BufferUsages::COPY_DST);

const DOWNLOAD_USAGE: BufferUsages = BufferUsages::MAP_READ.union(BufferUsages::COPY_DST);

const IMAGE_USAGE: TextureUsages = TextureUsages::STORAGE_BINDING
    .union(TextureUsages::TEXTURE_BINDING)
    .union(TextureUsages::COPY_SRC)
    .union(TextureUsages::COPY_DST);

struct WgpuShader {
    label: &'static str,
    pipeline: ComputePipeline,
    layout: Vec<Vec<BindType>>,
    bind_group_layouts: Vec<BindGroupLayout>,
}

/// An application-owned resource standing in for a proxy during one run.
pub enum ExternalResource<'a> {
    Buffer(BufferProxy, &'a Buffer),
    Image(ImageProxy, &'a TextureView),
}

struct BindMapBuffer {
    buffer: Buffer,
    label: &'static str,
}

#[derive(Default)]
struct BindMap {
    buf_map: HashMap<ResourceId, BindMapBuffer>,
    image_map: HashMap<ResourceId, (Texture, TextureView)>,
}

#[derive(Hash, PartialEq, Eq)]
struct BufferProperties {
    size: u64,
    usages: BufferUsages,
    name: &'static str,
}

#[derive(Default)]
struct ResourcePool {
    bufs: HashMap<BufferProperties, Vec<Buffer>>,
}

/// External resources, scoped to a single call of `run_recording_with()`.
#[derive(Default)]
struct TransientBindMap<'a> {
    bufs: HashMap<ResourceId, &'a Buffer>,
    images: HashMap<ResourceId, &'a TextureView>,
}

struct CachedBindGroup {
    bind_group: BindGroup,
    members: Vec<ResourceId>,
}

/// Row padding of an image download.
struct RowLayout {
    unpadded: u32,
    padded: u32,
    height: u32,
}

struct Download {
    buffer: Buffer,
    size: u64,
    name: &'static str,
    rows: Option<RowLayout>,
}

/// Runs recordings by encoding them into one wgpu command buffer per run.
pub struct WgpuEngine {
    device: Device,
    queue: Queue,
    shaders: Vec<WgpuShader>,
    bind_group_layouts: HashMap<Vec<BindType>, BindGroupLayout>,
    pool: ResourcePool,
    bind_map: BindMap,
    bind_groups: HashMap<ResourceId, CachedBindGroup>,
    downloads: HashMap<ResourceId, Download>,
    validator: ProtocolValidator,
}

fn align4(size: u64) -> u64 {
    size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

impl WgpuEngine {
    pub fn new(device: &Device, queue: &Queue) -> Self {
        Self {
            device: device.clone(),
            queue: queue.clone(),
            shaders: Vec::new(),
            bind_group_layouts: HashMap::new(),
            pool: ResourcePool::default(),
            bind_map: BindMap::default(),
            bind_groups: HashMap::new(),
            downloads: HashMap::new(),
            validator: ProtocolValidator::default(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The texture backing `image`, if a command has created it.
    ///
    /// Lets applications copy a color target into their own textures without a readback.
    pub fn texture(&self, image: &ImageProxy) -> Option<&Texture> {
        self.bind_map.image_map.get(&image.id).map(|(texture, _)| texture)
    }

    /// Shares one layout object between every shader declaring the same group, so cached bind
    /// groups can be used with any of them.
    fn bind_group_layout(&mut self, group: &[BindType]) -> BindGroupLayout {
        match self.bind_group_layouts.entry(group.to_vec()) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let entries = Self::create_bind_group_layout_entries(
                    group.iter().map(|ty| (*ty, wgpu::ShaderStages::COMPUTE)),
                );
                let layout = self
                    .device
                    .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: None,
                        entries: &entries,
                    });
                vacant.insert(layout).clone()
            }
        }
    }

    /// Like [`Engine::run_recording`], with `external_resources` bound in place of the engine's
    /// own resources for their proxies.
    pub fn run_recording_with(
        &mut self,
        recording: &Recording,
        external_resources: &[ExternalResource<'_>],
        label: &'static str,
    ) -> Result<()> {
        let mut free_bufs: HashSet<ResourceId> = HashSet::default();
        let mut free_images: HashSet<ResourceId> = HashSet::default();
        let transient_map = TransientBindMap::new(external_resources);

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor { label: Some(label) });
        for command in &recording.commands {
            self.validator.check(command)?;
            match command {
                Command::Upload(buf_proxy, bytes) => {
                    self.upload(buf_proxy, bytes, STORAGE_USAGE);
                }
                Command::UploadUniform(buf_proxy, bytes) => {
                    self.upload(buf_proxy, bytes, UNIFORM_USAGE);
                }
                Command::UploadImage(image_proxy, bytes) => {
                    let (texture, _) = self.bind_map.get_or_create_image(*image_proxy, &self.device);
                    self.queue.write_texture(
                        wgpu::TexelCopyTextureInfo {
                            texture,
                            mip_level: 0,
                            origin: wgpu::Origin3d { x: 0, y: 0, z: 0 },
                            aspect: TextureAspect::All,
                        },
                        bytes,
                        wgpu::TexelCopyBufferLayout {
                            offset: 0,
                            bytes_per_row: Some(
                                image_proxy.width * image_proxy.format.bytes_per_pixel(),
                            ),
                            rows_per_image: None,
                        },
                        wgpu::Extent3d {
                            width: image_proxy.width,
                            height: image_proxy.height,
                            depth_or_array_layers: 1,
                        },
                    );
                }
                Command::Write(buf_proxy, offset, bytes) => {
                    self.bind_map.ensure_buf(
                        buf_proxy,
                        &transient_map,
                        &mut self.pool,
                        &self.device,
                        &mut encoder,
                    );
                    let dst = self
                        .bind_map
                        .get_gpu_buf(&transient_map, buf_proxy.id)
                        .ok_or(Error::UnavailableBufferUsed(buf_proxy.name, "write"))?;
                    let contents = pad_to_copy_alignment(bytes);
                    let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some(buf_proxy.name),
                        contents: &contents,
                        usage: BufferUsages::COPY_SRC,
                    });
                    encoder.copy_buffer_to_buffer(
                        &staging,
                        0,
                        dst,
                        *offset,
                        contents.len() as u64,
                    );
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    self.bind_map.ensure_buf(
                        dst,
                        &transient_map,
                        &mut self.pool,
                        &self.device,
                        &mut encoder,
                    );
                    let src_buf = self
                        .bind_map
                        .get_gpu_buf(&transient_map, src.id)
                        .ok_or(Error::UnavailableBufferUsed(src.name, "copy source"))?;
                    let dst_buf = self
                        .bind_map
                        .get_gpu_buf(&transient_map, dst.id)
                        .ok_or(Error::UnavailableBufferUsed(dst.name, "copy destination"))?;
                    encoder.copy_buffer_to_buffer(src_buf, *src_offset, dst_buf, *dst_offset, *size);
                }
                Command::Download(proxy) => {
                    let src_buf = self
                        .bind_map
                        .get_gpu_buf(&transient_map, proxy.id)
                        .ok_or(Error::UnavailableBufferUsed(proxy.name, "download"))?;
                    let size = align4(proxy.size);
                    let buf = self.pool.get_buf(size, "download", DOWNLOAD_USAGE, &self.device);
                    encoder.copy_buffer_to_buffer(src_buf, 0, &buf, 0, size);
                    self.downloads.insert(
                        proxy.id,
                        Download {
                            buffer: buf,
                            size: proxy.size,
                            name: proxy.name,
                            rows: None,
                        },
                    );
                }
                Command::DownloadImage(proxy) => {
                    let Some((texture, _)) = self.bind_map.image_map.get(&proxy.id) else {
                        return Err(Error::UnavailableImageUsed(proxy.name, "download"));
                    };
                    let unpadded = proxy.width * proxy.format.bytes_per_pixel();
                    let padded = unpadded.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
                    let size = u64::from(padded) * u64::from(proxy.height);
                    let buf = self.pool.get_buf(size, "download", DOWNLOAD_USAGE, &self.device);
                    encoder.copy_texture_to_buffer(
                        wgpu::TexelCopyTextureInfo {
                            texture,
                            mip_level: 0,
                            origin: wgpu::Origin3d::ZERO,
                            aspect: TextureAspect::All,
                        },
                        wgpu::TexelCopyBufferInfo {
                            buffer: &buf,
                            layout: wgpu::TexelCopyBufferLayout {
                                offset: 0,
                                bytes_per_row: Some(padded),
                                rows_per_image: None,
                            },
                        },
                        wgpu::Extent3d {
                            width: proxy.width,
                            height: proxy.height,
                            depth_or_array_layers: 1,
                        },
                    );
                    self.downloads.insert(
                        proxy.id,
                        Download {
                            buffer: buf,
                            size,
                            name: proxy.name,
                            rows: Some(RowLayout {
                                unpadded,
                                padded,
                                height: proxy.height,
                            }),
                        },
                    );
                }
                Command::Clear(proxy, offset, size) => {
                    self.bind_map.ensure_buf(
                        proxy,
                        &transient_map,
                        &mut self.pool,
                        &self.device,
                        &mut encoder,
                    );
                    let buf = self
                        .bind_map
                        .get_gpu_buf(&transient_map, proxy.id)
                        .ok_or(Error::UnavailableBufferUsed(proxy.name, "clear"))?;
                    encoder.clear_buffer(buf, *offset, *size);
                }
                Command::FreeBuffer(proxy) => {
                    free_bufs.insert(proxy.id);
                }
                Command::FreeImage(proxy) => {
                    free_images.insert(proxy.id);
                }
                Command::Dispatch(shader_id, wg_size, tables) => {
                    let (x, y, z) = *wg_size;
                    let (pipeline, layouts) = self.checked_shader(*shader_id, tables)?;
                    // Zero sized dispatches are skipped rather than encoded.
                    if x == 0 || y == 0 || z == 0 {
                        continue;
                    }
                    let bind_groups =
                        self.bind_groups_for(tables, &layouts, &transient_map, &mut encoder)?;
                    let mut cpass = encoder.begin_compute_pass(&ComputePassDescriptor {
                        label: None,
                        timestamp_writes: None,
                    });
                    cpass.set_pipeline(&pipeline);
                    for (group, bind_group) in bind_groups.iter().enumerate() {
                        cpass.set_bind_group(group as u32, bind_group, &[]);
                    }
                    cpass.dispatch_workgroups(x, y, z);
                }
                Command::DispatchIndirect(shader_id, proxy, offset, tables) => {
                    let (pipeline, layouts) = self.checked_shader(*shader_id, tables)?;
                    let bind_groups =
                        self.bind_groups_for(tables, &layouts, &transient_map, &mut encoder)?;
                    let args = self
                        .bind_map
                        .get_gpu_buf(&transient_map, proxy.id)
                        .ok_or(Error::UnavailableBufferUsed(proxy.name, "indirect arguments"))?;
                    let mut cpass = encoder.begin_compute_pass(&ComputePassDescriptor {
                        label: None,
                        timestamp_writes: None,
                    });
                    cpass.set_pipeline(&pipeline);
                    for (group, bind_group) in bind_groups.iter().enumerate() {
                        cpass.set_bind_group(group as u32, bind_group, &[]);
                    }
                    cpass.dispatch_workgroups_indirect(args, *offset);
                }
                // wgpu inserts the hardware barriers itself; the validator has checked these.
                Command::Barrier(_) => {}
            }
        }
        self.queue.submit(Some(encoder.finish()));
        for id in free_bufs {
            if let Some(buf) = self.bind_map.buf_map.remove(&id) {
                let props = BufferProperties {
                    size: buf.buffer.size(),
                    usages: buf.buffer.usage(),
                    name: buf.label,
                };
                self.pool.bufs.entry(props).or_default().push(buf.buffer);
            }
            self.evict_bind_groups(id);
        }
        for id in free_images {
            self.bind_map.image_map.remove(&id);
            self.evict_bind_groups(id);
        }
        Ok(())
    }

    fn upload(&mut self, proxy: &BufferProxy, bytes: &[u8], usage: BufferUsages) {
        let buf = self
            .pool
            .get_buf(align4(proxy.size), proxy.name, usage, &self.device);
        self.queue.write_buffer(&buf, 0, &pad_to_copy_alignment(bytes));
        self.bind_map.insert_buf(proxy, buf);
    }

    fn checked_shader(
        &self,
        shader_id: ShaderId,
        tables: &[DescriptorTable],
    ) -> Result<(ComputePipeline, Vec<BindGroupLayout>)> {
        let shader = self
            .shaders
            .get(shader_id.0)
            .ok_or_else(|| Error::MissingShader(format!("shader id {}", shader_id.0)))?;
        check_layout(shader.label, &shader.layout, tables)?;
        Ok((shader.pipeline.clone(), shader.bind_group_layouts.clone()))
    }

    fn evict_bind_groups(&mut self, id: ResourceId) {
        self.bind_groups
            .retain(|_, cached| !cached.members.contains(&id));
    }

    fn bind_groups_for(
        &mut self,
        tables: &[DescriptorTable],
        layouts: &[BindGroupLayout],
        transient_map: &TransientBindMap<'_>,
        encoder: &mut CommandEncoder,
    ) -> Result<Vec<BindGroup>> {
        let mut groups = Vec::with_capacity(tables.len());
        for (table, layout) in tables.iter().zip(layouts) {
            if let Some(cached) = self.bind_groups.get(&table.id()) {
                groups.push(cached.bind_group.clone());
                continue;
            }
            for binding in table.entries() {
                match &binding.resource {
                    ResourceProxy::Buffer(proxy) => {
                        self.bind_map.ensure_buf(
                            proxy,
                            transient_map,
                            &mut self.pool,
                            &self.device,
                            encoder,
                        );
                    }
                    ResourceProxy::Image(proxy) => {
                        if !transient_map.images.contains_key(&proxy.id) {
                            self.bind_map.get_or_create_image(*proxy, &self.device);
                        }
                    }
                }
            }
            let bind_group =
                transient_map.create_bind_group(&self.bind_map, &self.device, table, layout)?;
            let external = table
                .entries()
                .iter()
                .any(|b| transient_map.contains(b.resource.id()));
            if !external {
                log::debug!("caching bind group for {}", table.label());
                self.bind_groups.insert(
                    table.id(),
                    CachedBindGroup {
                        bind_group: bind_group.clone(),
                        members: table.entries().iter().map(|b| b.resource.id()).collect(),
                    },
                );
            }
            groups.push(bind_group);
        }
        Ok(groups)
    }

    fn create_bind_group_layout_entries(
        layout: impl Iterator<Item = (BindType, wgpu::ShaderStages)>,
    ) -> Vec<wgpu::BindGroupLayoutEntry> {
        layout
            .enumerate()
            .map(|(i, (bind_type, visibility))| match bind_type {
                BindType::Buffer | BindType::BufReadOnly => wgpu::BindGroupLayoutEntry {
                    binding: i as u32,
                    visibility,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage {
                            read_only: bind_type == BindType::BufReadOnly,
                        },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                BindType::Uniform => wgpu::BindGroupLayoutEntry {
                    binding: i as u32,
                    visibility,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                BindType::Image(format) => wgpu::BindGroupLayoutEntry {
                    binding: i as u32,
                    visibility,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: format.to_wgpu(),
                        view_dimension: TextureViewDimension::D2,
                    },
                    count: None,
                },
                BindType::ImageRead(_) => wgpu::BindGroupLayoutEntry {
                    binding: i as u32,
                    visibility,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            })
            .collect::<Vec<_>>()
    }

    fn create_compute_pipeline(
        device: &Device,
        label: &str,
        wgsl: Cow<'_, str>,
        bind_group_layouts: &[BindGroupLayout],
    ) -> ComputePipeline {
        // Sources may come from an application directory, so keep wgpu's runtime checks.
        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(wgsl),
        });
        let layouts = bind_group_layouts.iter().collect::<Vec<_>>();
        let compute_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: None,
                bind_group_layouts: &layouts,
                push_constant_ranges: &[],
            });
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&compute_pipeline_layout),
            module: &shader_module,
            entry_point: None,
            compilation_options: PipelineCompilationOptions {
                zero_initialize_workgroup_memory: false,
                ..Default::default()
            },
            cache: None,
        })
    }

    fn read_download(&self, download: Download) -> Result<Vec<u8>> {
        let slice = download.buffer.slice(..align4(download.size));
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |v| {
            // The receiver outlives the map, so a failed send means nobody is waiting.
            let _ = sender.send(v);
        });
        block_on_wgpu(&self.device, receiver.receive())
            .ok_or(Error::DownloadUnavailable(download.name))??;
        let mapped = slice.get_mapped_range();
        let bytes = match &download.rows {
            None => mapped[..download.size as usize].to_vec(),
            Some(rows) => mapped
                .chunks_exact(rows.padded as usize)
                .take(rows.height as usize)
                .flat_map(|row| &row[..rows.unpadded as usize])
                .copied()
                .collect(),
        };
        drop(mapped);
        download.buffer.unmap();
        Ok(bytes)
    }
}

impl Engine for WgpuEngine {
    fn add_shader(&mut self, desc: ShaderDesc) -> Result<ShaderId> {
        let bind_group_layouts = desc
            .layout
            .iter()
            .map(|group| self.bind_group_layout(group))
            .collect::<Vec<_>>();
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline =
            Self::create_compute_pipeline(&self.device, desc.label, desc.wgsl, &bind_group_layouts);
        if let Some(error) = block_on_wgpu(&self.device, self.device.pop_error_scope()) {
            return Err(error.into());
        }
        let id = ShaderId(self.shaders.len());
        log::debug!("wgpu engine: registered {} as {id:?}", desc.label);
        self.shaders.push(WgpuShader {
            label: desc.label,
            pipeline,
            layout: desc.layout,
            bind_group_layouts,
        });
        Ok(id)
    }

    fn run_recording(&mut self, recording: &Recording, label: &'static str) -> Result<()> {
        self.run_recording_with(recording, &[], label)
    }

    fn download_buffer(&mut self, buf: &BufferProxy) -> Result<Vec<u8>> {
        let download = self
            .downloads
            .remove(&buf.id)
            .ok_or(Error::DownloadUnavailable(buf.name))?;
        self.read_download(download)
    }

    fn download_image(&mut self, image: &ImageProxy) -> Result<Vec<u8>> {
        let download = self
            .downloads
            .remove(&image.id)
            .ok_or(Error::DownloadUnavailable(image.name))?;
        self.read_download(download)
    }

    fn limits(&self) -> EngineLimits {
        let limits = self.device.limits();
        EngineLimits {
            max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size,
            max_compute_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
        }
    }
}

/// Copies must cover whole words, so odd sized data is zero padded.
fn pad_to_copy_alignment(bytes: &[u8]) -> Cow<'_, [u8]> {
    let len = align4(bytes.len() as u64) as usize;
    if len == bytes.len() {
        Cow::Borrowed(bytes)
    } else {
        let mut padded = bytes.to_vec();
        padded.resize(len, 0);
        Cow::Owned(padded)
    }
}

impl BindMap {
    fn insert_buf(&mut self, proxy: &BufferProxy, buffer: Buffer) {
        self.buf_map.insert(
            proxy.id,
            BindMapBuffer {
                buffer,
                label: proxy.name,
            },
        );
    }

    /// Creates a zeroed buffer for `proxy` unless it already exists.
    fn ensure_buf(
        &mut self,
        proxy: &BufferProxy,
        transient_map: &TransientBindMap<'_>,
        pool: &mut ResourcePool,
        device: &Device,
        encoder: &mut CommandEncoder,
    ) {
        if transient_map.bufs.contains_key(&proxy.id) {
            return;
        }
        if let Entry::Vacant(vacant) = self.buf_map.entry(proxy.id) {
            let buffer = pool.get_buf(align4(proxy.size), proxy.name, STORAGE_USAGE, device);
            // Pooled buffers keep the contents of their previous owner.
            encoder.clear_buffer(&buffer, 0, None);
            vacant.insert(BindMapBuffer {
                buffer,
                label: proxy.name,
            });
        }
    }

    fn get_gpu_buf<'a>(
        &'a self,
        transient_map: &TransientBindMap<'a>,
        id: ResourceId,
    ) -> Option<&'a Buffer> {
        transient_map
            .bufs
            .get(&id)
            .copied()
            .or_else(|| self.buf_map.get(&id).map(|b| &b.buffer))
    }

    fn get_or_create_image(
        &mut self,
        proxy: ImageProxy,
        device: &Device,
    ) -> &(Texture, TextureView) {
        match self.image_map.entry(proxy.id) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let format = proxy.format.to_wgpu();
                let texture = device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(proxy.name),
                    size: wgpu::Extent3d {
                        width: proxy.width,
                        height: proxy.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    usage: IMAGE_USAGE,
                    format,
                    view_formats: &[],
                });
                let texture_view = texture.create_view(&wgpu::TextureViewDescriptor {
                    label: None,
                    usage: None,
                    dimension: Some(TextureViewDimension::D2),
                    aspect: TextureAspect::All,
                    mip_level_count: None,
                    base_mip_level: 0,
                    base_array_layer: 0,
                    array_layer_count: None,
                    format: Some(format),
                });
                vacant.insert((texture, texture_view))
            }
        }
    }
}

const SIZE_CLASS_BITS: u32 = 1;

impl ResourcePool {
    /// Get a buffer from the pool or create one.
    fn get_buf(
        &mut self,
        size: u64,
        name: &'static str,
        usage: BufferUsages,
        device: &Device,
    ) -> Buffer {
        let rounded_size = Self::size_class(size, SIZE_CLASS_BITS);
        let props = BufferProperties {
            size: rounded_size,
            usages: usage,
            name,
        };
        if let Some(buf_vec) = self.bufs.get_mut(&props)
            && let Some(buf) = buf_vec.pop()
        {
            return buf;
        }
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size: rounded_size,
            usage,
            mapped_at_creation: false,
        })
    }

    /// Quantize a size up to the nearest size class.
    fn size_class(x: u64, bits: u32) -> u64 {
        if x > 1 << bits {
            let a = (x - 1).leading_zeros();
            let b = (x - 1) | (((u64::MAX / 2) >> bits) >> a);
            b + 1
        } else {
            1 << bits
        }
    }
}

impl<'a> TransientBindMap<'a> {
    fn new(external_resources: &'a [ExternalResource<'a>]) -> Self {
        let mut bufs = HashMap::default();
        let mut images = HashMap::default();
        for resource in external_resources {
            match resource {
                ExternalResource::Buffer(proxy, gpu_buf) => {
                    bufs.insert(proxy.id, *gpu_buf);
                }
                ExternalResource::Image(proxy, gpu_image) => {
                    images.insert(proxy.id, *gpu_image);
                }
            }
        }
        Self { bufs, images }
    }

    fn contains(&self, id: ResourceId) -> bool {
        self.bufs.contains_key(&id) || self.images.contains_key(&id)
    }

    fn create_bind_group(
        &self,
        bind_map: &BindMap,
        device: &Device,
        table: &DescriptorTable,
        layout: &BindGroupLayout,
    ) -> Result<BindGroup> {
        let mut entries = Vec::with_capacity(table.entries().len());
        for (ix, binding) in table.entries().iter().enumerate() {
            let resource = match &binding.resource {
                ResourceProxy::Buffer(proxy) => {
                    let buffer = bind_map
                        .get_gpu_buf(self, proxy.id)
                        .ok_or(Error::UnavailableBufferUsed(proxy.name, table.label()))?;
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: 0,
                        size: NonZeroU64::new(align4(proxy.size)),
                    })
                }
                ResourceProxy::Image(proxy) => {
                    let view = self
                        .images
                        .get(&proxy.id)
                        .copied()
                        .or_else(|| bind_map.image_map.get(&proxy.id).map(|(_, view)| view))
                        .ok_or(Error::UnavailableImageUsed(proxy.name, table.label()))?;
                    wgpu::BindingResource::TextureView(view)
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: ix as u32,
                resource,
            });
        }
        Ok(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(table.label()),
            layout,
            entries: &entries,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes() {
        assert_eq!(ResourcePool::size_class(1, SIZE_CLASS_BITS), 2);
        assert_eq!(ResourcePool::size_class(5, SIZE_CLASS_BITS), 6);
        assert_eq!(ResourcePool::size_class(7, SIZE_CLASS_BITS), 8);
        assert_eq!(ResourcePool::size_class(12, SIZE_CLASS_BITS), 12);
        assert_eq!(ResourcePool::size_class(13, SIZE_CLASS_BITS), 16);
    }

    #[test]
    fn odd_uploads_are_padded() {
        assert_eq!(&*pad_to_copy_alignment(&[1, 2, 3, 4]), &[1, 2, 3, 4]);
        assert_eq!(&*pad_to_copy_alignment(&[1, 2, 3, 4, 5, 6]), &[1, 2, 3, 4, 5, 6, 0, 0]);
    }
}
