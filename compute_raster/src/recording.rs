// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::barrier::Barrier;
use crate::descriptor::DescriptorTable;
use crate::indirect::IndirectCommandLayout;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct ShaderId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub NonZeroU64);

impl ResourceId {
    pub fn next() -> Self {
        // We initialize with 1 so that the conversion below succeeds
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(NonZeroU64::new(ID_COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap())
    }
}

/// List of [`Command`]s for an engine to execute in order.
#[derive(Default)]
pub struct Recording {
    pub commands: Vec<Command>,
}

/// Proxy used as a handle to a buffer.
///
/// Buffers are materialized zero-filled the first time a command uses them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferProxy {
    pub size: u64,
    pub id: ResourceId,
    pub name: &'static str,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// Four 8 bit unorm channels, red in the lowest byte.
    Rgba8,
}

/// Proxy used as a handle to an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageProxy {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub id: ResourceId,
    pub name: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceProxy {
    Buffer(BufferProxy),
    Image(ImageProxy),
}

/// Single command inside a [`Recording`] to get executed by an engine.
pub enum Command {
    /// Commands the data to be uploaded to the given buffer.
    Upload(BufferProxy, Vec<u8>),
    /// Commands the data to be uploaded to the given buffer as a uniform.
    UploadUniform(BufferProxy, Vec<u8>),
    /// Commands the data to be uploaded to the given image.
    UploadImage(ImageProxy, Vec<u8>),
    /// Overwrites part of an existing buffer, ordered with the surrounding commands.
    Write(BufferProxy, u64, Vec<u8>),
    CopyBuffer {
        src: BufferProxy,
        src_offset: u64,
        dst: BufferProxy,
        dst_offset: u64,
        size: u64,
    },
    Download(BufferProxy),
    DownloadImage(ImageProxy),
    /// Commands to clear the buffer from an offset on for a length of the given size.
    /// If the size is [None], it clears until the end.
    Clear(BufferProxy, u64, Option<u64>),
    /// Commands to free the buffer.
    FreeBuffer(BufferProxy),
    /// Commands to free the image.
    FreeImage(ImageProxy),
    /// Bound tables occupy consecutive bind groups, starting at group 0.
    Dispatch(ShaderId, (u32, u32, u32), Vec<DescriptorTable>),
    DispatchIndirect(ShaderId, BufferProxy, u64, Vec<DescriptorTable>),
    Barrier(SmallVec<[Barrier; 8]>),
}

/// The type of resource that will be bound to a slot in a shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindType {
    /// A storage buffer with read/write access.
    Buffer,
    /// A storage buffer with read only access.
    BufReadOnly,
    /// A small buffer to be used as uniforms.
    Uniform,
    /// A write only storage image.
    Image(ImageFormat),
    /// A sampled image with read only access.
    ImageRead(ImageFormat),
}

impl BindType {
    /// Whether a dispatch may write through a binding of this type.
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Buffer | Self::Image(_))
    }
}

impl Recording {
    /// Appends a [`Command`] to the back of the [`Recording`].
    pub fn push(&mut self, cmd: Command) {
        self.commands.push(cmd);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands to upload the given data to a new buffer with the given name.
    /// Returns a [`BufferProxy`] to the buffer.
    pub fn upload(&mut self, name: &'static str, data: impl Into<Vec<u8>>) -> BufferProxy {
        let data = data.into();
        let buf_proxy = BufferProxy::new(data.len() as u64, name);
        self.push(Command::Upload(buf_proxy, data));
        buf_proxy
    }

    /// Commands to upload the given data to a new buffer as a uniform with the given name.
    /// Returns a [`BufferProxy`] to the buffer.
    pub fn upload_uniform(&mut self, name: &'static str, data: impl Into<Vec<u8>>) -> BufferProxy {
        let data = data.into();
        let buf_proxy = BufferProxy::new(data.len() as u64, name);
        self.push(Command::UploadUniform(buf_proxy, data));
        buf_proxy
    }

    /// Commands to upload the given data to a new image with the given dimensions and format.
    /// Returns an [`ImageProxy`] to the image.
    pub fn upload_image(
        &mut self,
        name: &'static str,
        width: u32,
        height: u32,
        format: ImageFormat,
        data: impl Into<Vec<u8>>,
    ) -> ImageProxy {
        let data = data.into();
        let image_proxy = ImageProxy::new(width, height, format, name);
        self.push(Command::UploadImage(image_proxy, data));
        image_proxy
    }

    /// Overwrites `data.len()` bytes of `buf` starting at `offset`.
    ///
    /// Unlike an upload, the write happens in command order, so dispatches recorded
    /// earlier still see the previous contents.
    pub fn write(&mut self, buf: BufferProxy, offset: u64, data: impl Into<Vec<u8>>) {
        let data = data.into();
        debug_assert!(offset + data.len() as u64 <= buf.size, "write past end of {}", buf.name);
        self.push(Command::Write(buf, offset, data));
    }

    pub fn copy_buffer(
        &mut self,
        src: BufferProxy,
        src_offset: u64,
        dst: BufferProxy,
        dst_offset: u64,
        size: u64,
    ) {
        self.push(Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    pub fn dispatch<T>(&mut self, shader: ShaderId, wg_size: (u32, u32, u32), tables: T)
    where
        T: IntoIterator<Item = DescriptorTable>,
    {
        self.push(Command::Dispatch(shader, wg_size, tables.into_iter().collect()));
    }

    /// Do an indirect dispatch.
    ///
    /// Dispatch a compute shader where the size is determined dynamically.
    /// The `buf` argument contains the dispatch size, 3 `u32` values beginning
    /// at the given byte `offset`. See also [`IndirectCommandLayout::dispatch`].
    pub fn dispatch_indirect<T>(&mut self, shader: ShaderId, buf: BufferProxy, offset: u64, tables: T)
    where
        T: IntoIterator<Item = DescriptorTable>,
    {
        debug_assert!(
            offset + IndirectCommandLayout::DISPATCH.stride() <= buf.size,
            "{} can't hold dispatch arguments at {offset}",
            buf.name
        );
        self.push(Command::DispatchIndirect(
            shader,
            buf,
            offset,
            tables.into_iter().collect(),
        ));
    }

    /// Records a batch of barriers. Empty batches are dropped.
    pub fn barrier(&mut self, barriers: impl IntoIterator<Item = Barrier>) {
        let barriers: SmallVec<[Barrier; 8]> = barriers.into_iter().collect();
        if !barriers.is_empty() {
            self.push(Command::Barrier(barriers));
        }
    }

    /// Prepare a buffer for downloading.
    ///
    /// Currently this copies to a download buffer. The original buffer can be freed
    /// immediately after.
    pub fn download(&mut self, buf: BufferProxy) {
        self.push(Command::Download(buf));
    }

    /// Prepare an image for downloading as tightly packed rows.
    pub fn download_image(&mut self, image: ImageProxy) {
        self.push(Command::DownloadImage(image));
    }

    /// Commands to clear the whole buffer.
    pub fn clear_all(&mut self, buf: BufferProxy) {
        self.push(Command::Clear(buf, 0, None));
    }

    /// Commands to free the given buffer.
    pub fn free_buffer(&mut self, buf: BufferProxy) {
        self.push(Command::FreeBuffer(buf));
    }

    /// Commands to free the given image.
    pub fn free_image(&mut self, image: ImageProxy) {
        self.push(Command::FreeImage(image));
    }

    /// Commands to free the given resource.
    pub fn free_resource(&mut self, resource: ResourceProxy) {
        match resource {
            ResourceProxy::Buffer(buf) => self.free_buffer(buf),
            ResourceProxy::Image(image) => self.free_image(image),
        }
    }

    /// Appends the commands of `other`, leaving it empty.
    pub fn append(&mut self, other: &mut Self) {
        self.commands.append(&mut other.commands);
    }

    /// Returns a [`Vec`] containing all the [`Command`]s in order.
    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

impl BufferProxy {
    pub fn new(size: u64, name: &'static str) -> Self {
        let id = ResourceId::next();
        debug_assert!(size > 0);
        Self { id, size, name }
    }
}

impl ImageFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8 => 4,
        }
    }

    #[cfg(feature = "wgpu")]
    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            Self::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        }
    }

    #[cfg(feature = "wgpu")]
    pub fn from_wgpu(format: wgpu::TextureFormat) -> Option<Self> {
        match format {
            wgpu::TextureFormat::Rgba8Unorm => Some(Self::Rgba8),
            _ => None,
        }
    }
}

impl ImageProxy {
    pub fn new(width: u32, height: u32, format: ImageFormat, name: &'static str) -> Self {
        let id = ResourceId::next();
        Self {
            width,
            height,
            format,
            id,
            name,
        }
    }

    /// Size in bytes of the image's tightly packed pixels.
    pub fn byte_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.format.bytes_per_pixel())
    }
}

impl ResourceProxy {
    pub fn id(&self) -> ResourceId {
        match self {
            Self::Buffer(proxy) => proxy.id,
            Self::Image(proxy) => proxy.id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Buffer(proxy) => proxy.name,
            Self::Image(proxy) => proxy.name,
        }
    }

    pub fn as_buf(&self) -> Option<&BufferProxy> {
        match self {
            Self::Buffer(proxy) => Some(proxy),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageProxy> {
        match self {
            Self::Image(proxy) => Some(proxy),
            _ => None,
        }
    }
}

impl From<BufferProxy> for ResourceProxy {
    fn from(value: BufferProxy) -> Self {
        Self::Buffer(value)
    }
}

impl From<ImageProxy> for ResourceProxy {
    fn from(value: ImageProxy) -> Self {
        Self::Image(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = BufferProxy::new(4, "a");
        let b = BufferProxy::new(4, "a");
        assert_ne!(a.id, b.id);
        let image = ImageProxy::new(2, 3, ImageFormat::Rgba8, "image");
        assert_eq!(image.byte_size(), 24);
        assert_eq!(ResourceProxy::from(image).name(), "image");
    }

    #[test]
    fn empty_barrier_batches_are_dropped() {
        let mut recording = Recording::default();
        recording.barrier(Vec::<Barrier>::new());
        assert!(recording.is_empty());
        let buf = recording.upload("data", vec![0_u8; 16]);
        recording.barrier([Barrier::Uav(buf.into())]);
        assert_eq!(recording.commands.len(), 2);
    }
}
