// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! An engine that runs the CPU ports of the kernels.

use std::cell::RefCell;
use std::collections::HashMap;

use compute_raster_shaders::DispatchIndirectArgs;
use compute_raster_shaders::cpu::{CpuBinding, CpuTexture};

use crate::descriptor::DescriptorTable;
use crate::engine::{CpuShaderFn, Engine, EngineLimits, ProtocolValidator, ShaderDesc, check_layout};
use crate::recording::{
    BindType, BufferProxy, Command, ImageProxy, Recording, ResourceId, ResourceProxy, ShaderId,
};
use crate::{Error, Result};

struct CpuShader {
    label: &'static str,
    layout: Vec<Vec<BindType>>,
    run: CpuShaderFn,
}

/// Runs recordings synchronously on the calling thread.
///
/// Every command is checked against the barrier protocol before it runs, so recordings that
/// would race on a GPU fail here with an error naming the resource.
#[derive(Default)]
pub struct CpuEngine {
    shaders: Vec<CpuShader>,
    buffers: HashMap<ResourceId, RefCell<Vec<u8>>>,
    images: HashMap<ResourceId, RefCell<CpuTexture>>,
    downloads: HashMap<ResourceId, Vec<u8>>,
    validator: ProtocolValidator,
    limits: EngineLimits,
}

impl CpuEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine reporting `limits` instead of the WebGPU defaults.
    pub fn with_limits(limits: EngineLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    fn materialize_buf(&mut self, buf: &BufferProxy) -> &RefCell<Vec<u8>> {
        self.buffers
            .entry(buf.id)
            .or_insert_with(|| RefCell::new(vec![0; buf.size as usize]))
    }

    fn materialize_image(&mut self, image: &ImageProxy) -> &RefCell<CpuTexture> {
        self.images.entry(image.id).or_insert_with(|| {
            RefCell::new(CpuTexture::new(image.width as usize, image.height as usize))
        })
    }

    fn existing_buf(&self, buf: &BufferProxy, usage: &'static str) -> Result<&RefCell<Vec<u8>>> {
        self.buffers
            .get(&buf.id)
            .ok_or(Error::UnavailableBufferUsed(buf.name, usage))
    }

    fn run_command(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::Upload(buf, data) | Command::UploadUniform(buf, data) => {
                let mut contents = data.clone();
                contents.resize(buf.size as usize, 0);
                self.buffers.insert(buf.id, RefCell::new(contents));
            }
            Command::UploadImage(image, data) => {
                let mut texture = CpuTexture::new(image.width as usize, image.height as usize);
                for (pixel, bytes) in texture.pixels.iter_mut().zip(data.chunks_exact(4)) {
                    *pixel = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                }
                self.images.insert(image.id, RefCell::new(texture));
            }
            Command::Write(buf, offset, data) => {
                let range = byte_range(buf, *offset, data.len() as u64)?;
                self.materialize_buf(buf).borrow_mut()[range].copy_from_slice(data);
            }
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let src_range = byte_range(src, *src_offset, *size)?;
                let dst_range = byte_range(dst, *dst_offset, *size)?;
                let bytes = self.existing_buf(src, "copy source")?.borrow()[src_range].to_vec();
                self.materialize_buf(dst).borrow_mut()[dst_range].copy_from_slice(&bytes);
            }
            Command::Download(buf) => {
                let bytes = self.existing_buf(buf, "download")?.borrow().clone();
                self.downloads.insert(buf.id, bytes);
            }
            Command::DownloadImage(image) => {
                let texture = self
                    .images
                    .get(&image.id)
                    .ok_or(Error::UnavailableImageUsed(image.name, "download"))?;
                let bytes = texture.borrow().to_bytes();
                self.downloads.insert(image.id, bytes);
            }
            Command::Clear(buf, offset, size) => {
                let size = size.unwrap_or(buf.size.saturating_sub(*offset));
                let range = byte_range(buf, *offset, size)?;
                self.materialize_buf(buf).borrow_mut()[range].fill(0);
            }
            Command::FreeBuffer(buf) => {
                self.buffers.remove(&buf.id);
            }
            Command::FreeImage(image) => {
                self.images.remove(&image.id);
            }
            Command::Dispatch(shader_id, (x, y, z), tables) => {
                if *x == 0 || *y == 0 || *z == 0 {
                    return Ok(());
                }
                self.dispatch(*shader_id, *x, tables)?;
            }
            Command::DispatchIndirect(shader_id, args, offset, tables) => {
                let range = byte_range(args, *offset, size_of::<DispatchIndirectArgs>() as u64)?;
                let counts: DispatchIndirectArgs =
                    bytemuck::pod_read_unaligned(&self.existing_buf(args, "indirect arguments")?.borrow()[range]);
                if counts.x == 0 || counts.y == 0 || counts.z == 0 {
                    return Ok(());
                }
                self.dispatch(*shader_id, counts.x, tables)?;
            }
            // Commands run in order, so barriers only matter to the validator.
            Command::Barrier(_) => {}
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        shader_id: ShaderId,
        n_wg: u32,
        tables: &[DescriptorTable],
    ) -> Result<()> {
        let Some(shader) = self.shaders.get(shader_id.0) else {
            return Err(Error::MissingShader(format!("shader id {}", shader_id.0)));
        };
        check_layout(shader.label, &shader.layout, tables)?;
        let run = shader.run;
        for binding in tables.iter().flat_map(|t| t.entries()) {
            match &binding.resource {
                ResourceProxy::Buffer(buf) => {
                    self.materialize_buf(buf);
                }
                ResourceProxy::Image(image) => {
                    self.materialize_image(image);
                }
            }
        }
        let mut resources = Vec::new();
        for binding in tables.iter().flat_map(|t| t.entries()) {
            let resource = match &binding.resource {
                ResourceProxy::Buffer(buf) => {
                    CpuBinding::BufferRW(self.existing_buf(buf, "dispatch")?)
                }
                ResourceProxy::Image(image) => CpuBinding::Texture(
                    self.images
                        .get(&image.id)
                        .ok_or(Error::UnavailableImageUsed(image.name, "dispatch"))?,
                ),
            };
            resources.push(resource);
        }
        run(n_wg, &resources);
        Ok(())
    }
}

fn byte_range(buf: &BufferProxy, offset: u64, size: u64) -> Result<std::ops::Range<usize>> {
    if offset.checked_add(size).is_none_or(|end| end > buf.size) {
        return Err(Error::InvalidConfig(format!(
            "range {offset}+{size} is outside {} ({} bytes)",
            buf.name, buf.size
        )));
    }
    Ok(offset as usize..(offset + size) as usize)
}

impl Engine for CpuEngine {
    fn add_shader(&mut self, desc: ShaderDesc) -> Result<ShaderId> {
        let Some(run) = desc.cpu else {
            return Err(Error::MissingShader(format!(
                "{} has no CPU implementation",
                desc.label
            )));
        };
        let id = ShaderId(self.shaders.len());
        log::debug!("cpu engine: registered {} as {id:?}", desc.label);
        self.shaders.push(CpuShader {
            label: desc.label,
            layout: desc.layout,
            run,
        });
        Ok(id)
    }

    fn run_recording(&mut self, recording: &Recording, label: &'static str) -> Result<()> {
        log::trace!("{label}: running {} commands", recording.commands.len());
        for command in &recording.commands {
            self.validator.check(command)?;
            self.run_command(command)?;
        }
        Ok(())
    }

    fn download_buffer(&mut self, buf: &BufferProxy) -> Result<Vec<u8>> {
        self.downloads
            .remove(&buf.id)
            .ok_or(Error::DownloadUnavailable(buf.name))
    }

    fn download_image(&mut self, image: &ImageProxy) -> Result<Vec<u8>> {
        self.downloads
            .remove(&image.id)
            .ok_or(Error::DownloadUnavailable(image.name))
    }

    fn limits(&self) -> EngineLimits {
        self.limits
    }
}
