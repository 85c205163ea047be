// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CPU implementations of the raster kernels.
//!
//! Each kernel takes the workgroup count of its dispatch and the resources of every bound
//! table, flattened in group order. They follow the WGSL sources closely, so the CPU engine
//! produces the same lists, counters and pixels as a GPU run.

// Allow un-idiomatic Rust to more closely match shaders
#![expect(
    clippy::needless_range_loop,
    reason = "Keeps code easily comparable to GPU shaders"
)]

mod bin_raster;
mod clear;
mod pixel_raster;
mod raster;
mod tile_raster;
mod vs_stage;

pub use bin_raster::bin_raster;
pub use clear::{clear_color, clear_depth};
pub use pixel_raster::{pixel_depth, pixel_raster};
pub use tile_raster::tile_raster;
pub use vs_stage::{vs_stage, vs_stage_indexed};

use std::cell::{Ref, RefCell, RefMut};
use std::ops::{Deref, DerefMut};

use bytemuck::Pod;

use crate::types::{DispatchIndirectArgs, PrimitiveEntry};

#[derive(Clone, Copy)]
pub enum CpuBinding<'a> {
    Buffer(&'a [u8]),
    BufferRW(&'a RefCell<Vec<u8>>),
    Texture(&'a RefCell<CpuTexture>),
}

pub enum TypedBufGuard<'a, T: ?Sized> {
    Slice(&'a T),
    Interior(Ref<'a, T>),
}

pub enum TypedBufGuardMut<'a, T: ?Sized> {
    Interior(RefMut<'a, T>),
}

impl<T: ?Sized> Deref for TypedBufGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        match self {
            TypedBufGuard::Slice(s) => s,
            TypedBufGuard::Interior(r) => r,
        }
    }
}

impl<T: ?Sized> Deref for TypedBufGuardMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        match self {
            TypedBufGuardMut::Interior(r) => r,
        }
    }
}

impl<T: ?Sized> DerefMut for TypedBufGuardMut<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            TypedBufGuardMut::Interior(r) => r,
        }
    }
}

// Kernels trust the binding layout declared for them, so a mismatch is a bug in the caller.
impl CpuBinding<'_> {
    pub fn as_typed<T: Pod>(&self) -> TypedBufGuard<'_, T> {
        match self {
            CpuBinding::Buffer(b) => TypedBufGuard::Slice(bytemuck::from_bytes(&b[..size_of::<T>()])),
            CpuBinding::BufferRW(b) => TypedBufGuard::Interior(Ref::map(b.borrow(), |buf| {
                bytemuck::from_bytes(&buf[..size_of::<T>()])
            })),
            CpuBinding::Texture(_) => panic!("resource type mismatch"),
        }
    }

    pub fn as_typed_mut<T: Pod>(&self) -> TypedBufGuardMut<'_, T> {
        match self {
            CpuBinding::Buffer(_) => panic!("can't borrow external buffer mutably"),
            CpuBinding::BufferRW(b) => {
                TypedBufGuardMut::Interior(RefMut::map(b.borrow_mut(), |buf| {
                    bytemuck::from_bytes_mut(&mut buf[..size_of::<T>()])
                }))
            }
            CpuBinding::Texture(_) => panic!("resource type mismatch"),
        }
    }

    /// The buffer viewed as `T`s, ignoring trailing bytes that don't fill a whole element.
    pub fn as_slice<T: Pod>(&self) -> TypedBufGuard<'_, [T]> {
        match self {
            CpuBinding::Buffer(b) => TypedBufGuard::Slice(bytemuck::cast_slice(whole::<T>(b))),
            CpuBinding::BufferRW(b) => TypedBufGuard::Interior(Ref::map(b.borrow(), |buf| {
                bytemuck::cast_slice(whole::<T>(buf))
            })),
            CpuBinding::Texture(_) => panic!("resource type mismatch"),
        }
    }

    pub fn as_slice_mut<T: Pod>(&self) -> TypedBufGuardMut<'_, [T]> {
        match self {
            CpuBinding::Buffer(_) => panic!("can't borrow external buffer mutably"),
            CpuBinding::BufferRW(b) => {
                TypedBufGuardMut::Interior(RefMut::map(b.borrow_mut(), |buf| {
                    let len = buf.len() / size_of::<T>() * size_of::<T>();
                    bytemuck::cast_slice_mut(&mut buf[..len])
                }))
            }
            CpuBinding::Texture(_) => panic!("resource type mismatch"),
        }
    }

    pub fn as_tex(&self) -> Ref<'_, CpuTexture> {
        match self {
            CpuBinding::Texture(t) => t.borrow(),
            _ => panic!("resource type mismatch"),
        }
    }

    pub fn as_tex_mut(&self) -> RefMut<'_, CpuTexture> {
        match self {
            CpuBinding::Texture(t) => t.borrow_mut(),
            _ => panic!("resource type mismatch"),
        }
    }
}

fn whole<T>(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len() / size_of::<T>() * size_of::<T>()]
}

/// Structure used for binding textures to CPU shaders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuTexture {
    pub width: usize,
    pub height: usize,
    /// Packed RGBA8, red in the low byte.
    pub pixels: Vec<u32>,
}

impl CpuTexture {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }

    pub fn store(&mut self, x: u32, y: u32, color: [f32; 4]) {
        let (x, y) = (x as usize, y as usize);
        if x < self.width && y < self.height {
            self.pixels[y * self.width + x] = pack_unorm4x8(color);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|p| p.to_le_bytes()).collect()
    }
}

/// Converts like a store to an `rgba8unorm` texture.
pub fn pack_unorm4x8(color: [f32; 4]) -> u32 {
    let mut packed = 0;
    for (i, c) in color.into_iter().enumerate() {
        let byte = (0.5 + 255.0 * c.clamp(0.0, 1.0)).floor() as u32;
        packed |= byte << (i * 8);
    }
    packed
}

/// The atomic append shared by the binning and tiling kernels.
///
/// `count.x` never exceeds `capacity`; a pair that doesn't fit is dropped.
fn append(
    count: &mut DispatchIndirectArgs,
    list: &mut [PrimitiveEntry],
    capacity: u32,
    entry: PrimitiveEntry,
) {
    let slot = count.x;
    count.x += 1;
    if slot < capacity {
        list[slot as usize] = entry;
    } else {
        count.x -= 1;
    }
}
