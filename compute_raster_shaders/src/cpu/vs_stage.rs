// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::CpuBinding;
use crate::types::{Transform, VertexUniform};

const WG_SIZE: usize = 64;

fn fetch(config: &VertexUniform, vertices: &[f32], vertex_ix: u32, word: u32) -> f32 {
    let ix = (vertex_ix * config.vertex_stride + word) as usize;
    vertices.get(ix).copied().unwrap_or(0.0)
}

fn vs_stage_main(
    n_wg: u32,
    transform: &Transform,
    config: &VertexUniform,
    vertices: &[f32],
    load_index: impl Fn(u32) -> u32,
    positions: &mut [[f32; 4]],
    attribs: &mut [&mut [f32]],
) {
    for wg in 0..n_wg as usize {
        for local_ix in 0..WG_SIZE {
            let ix = (wg * WG_SIZE + local_ix) as u32;
            if ix >= config.count {
                return;
            }
            let vertex_ix = load_index(ix);
            let p = [
                fetch(config, vertices, vertex_ix, 0),
                fetch(config, vertices, vertex_ix, 1),
                fetch(config, vertices, vertex_ix, 2),
                1.0,
            ];
            // Out of range writes are dropped, as with robust buffer access.
            if let Some(slot) = positions.get_mut(ix as usize) {
                *slot = transform.apply(p);
            }
            for (i, attrib) in attribs.iter_mut().enumerate() {
                for c in 0..config.attrib_components[i] {
                    let out = (ix * config.attrib_stride[i] + c) as usize;
                    if let Some(slot) = attrib.get_mut(out) {
                        *slot = fetch(config, vertices, vertex_ix, config.attrib_offset[i] + c);
                    }
                }
            }
        }
    }
}

/// Output slot `i` receives vertex `i`.
///
/// Resources: transform, vertex uniform, vertices, positions, then one buffer per attribute.
pub fn vs_stage(n_wg: u32, resources: &[CpuBinding<'_>]) {
    let transform = resources[0].as_typed::<Transform>();
    let config = resources[1].as_typed::<VertexUniform>();
    let vertices = resources[2].as_slice::<f32>();
    let mut positions = resources[3].as_slice_mut::<[f32; 4]>();
    let mut guards = resources[4..]
        .iter()
        .map(|r| r.as_slice_mut::<f32>())
        .collect::<Vec<_>>();
    let mut attribs = guards.iter_mut().map(|g| &mut **g).collect::<Vec<_>>();
    vs_stage_main(
        n_wg,
        &transform,
        &config,
        &vertices,
        |ix| ix,
        &mut positions,
        &mut attribs,
    );
}

/// Output slot `i` receives the vertex named by index `i`.
///
/// Resources: transform, vertex uniform, vertices, indices, positions, then one buffer per
/// attribute.
pub fn vs_stage_indexed(n_wg: u32, resources: &[CpuBinding<'_>]) {
    let transform = resources[0].as_typed::<Transform>();
    let config = resources[1].as_typed::<VertexUniform>();
    let vertices = resources[2].as_slice::<f32>();
    let indices = resources[3].as_slice::<u32>();
    let mut positions = resources[4].as_slice_mut::<[f32; 4]>();
    let mut guards = resources[5..]
        .iter()
        .map(|r| r.as_slice_mut::<f32>())
        .collect::<Vec<_>>();
    let mut attribs = guards.iter_mut().map(|g| &mut **g).collect::<Vec<_>>();
    let index_u16 = config.index_u16 != 0;
    let load_index = |ix: u32| {
        if index_u16 {
            let word = indices.get(ix as usize / 2).copied().unwrap_or(0);
            if ix & 1 == 1 { word >> 16 } else { word & 0xffff }
        } else {
            indices.get(ix as usize).copied().unwrap_or(0)
        }
    };
    vs_stage_main(
        n_wg,
        &transform,
        &config,
        &vertices,
        load_index,
        &mut positions,
        &mut attribs,
    );
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    fn buffer<T: bytemuck::Pod>(data: &[T]) -> RefCell<Vec<u8>> {
        RefCell::new(bytemuck::cast_slice(data).to_vec())
    }

    #[test]
    fn indexed_u16_with_attribute() {
        let mut transform = Transform::IDENTITY;
        transform.world_view_proj[3] = [1.0, 0.0, 0.0, 1.0];
        let config = VertexUniform {
            count: 3,
            vertex_stride: 4,
            num_attributes: 1,
            index_u16: 1,
            attrib_offset: [3, 0, 0, 0],
            attrib_components: [1, 0, 0, 0],
            attrib_stride: [1, 0, 0, 0],
        };
        let vertices = [0.0, 0.0, 0.0, 10.0, 1.0, 2.0, 3.0, 20.0_f32];
        // Indices 1, 0, 1 packed two per word.
        let indices = [1_u32, 1];
        let bufs = [
            buffer(&[transform]),
            buffer(&[config]),
            buffer(&vertices),
            buffer(&indices),
            RefCell::new(vec![0; 3 * 16]),
            RefCell::new(vec![0; 3 * 4]),
        ];
        let resources = bufs.iter().map(CpuBinding::BufferRW).collect::<Vec<_>>();
        vs_stage_indexed(1, &resources);
        let positions = bytemuck::cast_slice::<u8, [f32; 4]>(&bufs[4].borrow()).to_vec();
        assert_eq!(positions[0], [2.0, 2.0, 3.0, 1.0]);
        assert_eq!(positions[1], [1.0, 0.0, 0.0, 1.0]);
        let attrib = bytemuck::cast_slice::<u8, f32>(&bufs[5].borrow()).to_vec();
        assert_eq!(attrib, [20.0, 10.0, 20.0]);
    }
}
