// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pipeline state carried across draws and frames.

use compute_raster::{
    BindType, BinningMode, CLEAR_COLOR, CpuEngine, DescriptorTable, Engine, Error, IndexFormat,
    OutputLayout, PipelineBuilder, RasterConfig, Recording, Shading, Stage, Transform,
    VertexFormat, Viewport,
};
use compute_raster_tests::{
    DrawCall, GREEN, Harness, RED, TestParams, count_differences, init_logging, ndc,
    reference_frame, unorm8,
};

const WIDTH: u32 = 256;
const HEIGHT: u32 = 128;

fn fullscreen(z: f32, color: [f32; 4]) -> DrawCall {
    DrawCall::flat(vec![[-1.0, -1.0, z], [3.0, -1.0, z], [-1.0, 3.0, z]], color)
}

fn scene() -> Vec<DrawCall> {
    let v = |x, y, z| ndc(x, y, z, WIDTH, HEIGHT);
    vec![
        DrawCall::flat(
            vec![v(12., 8., 0.7), v(240., 20., 0.2), v(30., 120., 0.4)],
            GREEN,
        ),
        DrawCall::flat(
            vec![
                v(200., 4., 0.3),
                v(250., 110., 0.3),
                v(60., 90., 0.3),
                v(0., 0., 0.9),
                v(90., 0., 0.9),
                v(0., 70., 0.9),
            ],
            RED,
        ),
    ]
}

fn params(mode: BinningMode) -> TestParams {
    TestParams {
        mode,
        depth: true,
        ..TestParams::new("frames", WIDTH, HEIGHT)
    }
}

#[test]
fn repeated_frames_are_identical() {
    let params = params(BinningMode::ThreeLevel);
    let mut harness = Harness::cpu(&params).unwrap();
    let first = harness.render(&scene()).unwrap();
    let second = harness.render(&scene()).unwrap();
    assert_eq!(first.pixels, second.pixels);
    assert_eq!(first.depth, second.depth);
    assert_eq!(first.counters, second.counters);
    assert_eq!(first.bins, second.bins);
    assert_eq!(first.tiles, second.tiles);
    let reference = reference_frame(&params, &scene());
    assert_eq!(count_differences(&second.pixels, &reference.to_bytes()), 0);
}

#[test]
fn three_level_matches_two_level() {
    let two = Harness::cpu(&params(BinningMode::TwoLevel))
        .unwrap()
        .render(&scene())
        .unwrap();
    let three = Harness::cpu(&params(BinningMode::ThreeLevel))
        .unwrap()
        .render(&scene())
        .unwrap();
    assert_eq!(count_differences(&two.pixels, &three.pixels), 0);
    assert_eq!(two.depth, three.depth);
    assert_eq!(two.counters.tiles, None);
    assert!(three.counters.tiles.is_some_and(|tiles| tiles > 0));
}

#[test]
fn counters_restart_every_draw() {
    let params = params(BinningMode::ThreeLevel);
    let mut harness = Harness::cpu(&params).unwrap();
    let frame = harness.render(&[fullscreen(0.5, RED)]).unwrap();
    assert!(frame.counters.bins > 0);

    let empty = DrawCall::flat(Vec::new(), RED);
    let frame = harness.render(&[empty]).unwrap();
    assert_eq!(frame.counters.bins, 0);
    assert_eq!(frame.counters.tiles, Some(0));
    let clear = unorm8(CLEAR_COLOR.components);
    assert!(frame.pixels.chunks_exact(4).all(|p| p == clear));
}

#[test]
fn clear_only_frame() {
    let params = params(BinningMode::TwoLevel);
    let mut harness = Harness::cpu(&params).unwrap();
    harness.render(&scene()).unwrap();
    let frame = harness.render(&[]).unwrap();
    let clear = unorm8(CLEAR_COLOR.components);
    assert!(frame.pixels.chunks_exact(4).all(|p| p == clear));
    assert!(frame.depth.unwrap().iter().all(|d| *d == 1.0));
}

#[test]
fn vertices_are_transformed() {
    let params = TestParams::new("transform", WIDTH, HEIGHT);
    let mut harness = Harness::cpu(&params).unwrap();
    let mut draw = DrawCall::flat(
        vec![
            [0.0, 0.0, 0.5],
            [1.0, 0.0, 0.5],
            [0.0, 1.0, 0.5],
            [-1.0, -1.0, 0.2],
            [0.5, -1.0, 0.2],
            [-1.0, 0.5, 0.2],
            // Left over, not part of a triangle.
            [0.3, 0.3, 0.3],
        ],
        RED,
    );
    draw.transform = Transform {
        world_view_proj: [
            [0.5, 0.0, 0.0, 0.0],
            [0.0, 0.5, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.25, -0.25, 0.0, 1.0],
        ],
    };
    let frame = harness.render(std::slice::from_ref(&draw)).unwrap();
    for (i, vertex) in draw.vertices.iter().enumerate() {
        let [x, y, z] = *vertex;
        assert_eq!(frame.positions[i], draw.transform.apply([x, y, z, 1.0]), "vertex {i}");
    }
    assert_eq!(frame.positions[0], [0.25, -0.25, 0.5, 1.0]);
    let reference = reference_frame(&params, &[draw]);
    assert_eq!(count_differences(&frame.pixels, &reference.to_bytes()), 0);
}

#[test]
fn indexed_draw_reads_vertices_through_indices() {
    let params = TestParams::new("indexed", WIDTH, HEIGHT);
    let mut harness = Harness::cpu(&params).unwrap();
    let v = |x, y| ndc(x, y, 0.5, WIDTH, HEIGHT);
    let draw = DrawCall::flat(vec![v(20., 10.), v(200., 40.), v(50., 110.)], RED);
    let indices: [u16; 3] = [2, 0, 1];

    let mut recording = Recording::default();
    let pipeline = &mut harness.pipeline;
    let vertices = pipeline
        .create_vertex_buffer(&mut recording, bytemuck::cast_slice(&draw.vertices), 3, 12)
        .unwrap();
    let index_buffer = pipeline
        .create_index_buffer(
            &mut recording,
            bytemuck::cast_slice(&indices),
            3,
            IndexFormat::Uint16,
        )
        .unwrap();
    pipeline.set_vertex_buffer(vertices);
    pipeline.set_index_buffer(index_buffer);
    harness.bind_draw_tables(&mut recording, &draw).unwrap();
    harness.pipeline.clear_color(harness.color, None);
    harness.pipeline.draw_indexed(&mut recording, 3);
    recording.download(harness.pipeline.positions());
    recording.download_image(harness.color);
    harness.engine.run_recording(&recording, "indexed").unwrap();

    let positions = harness
        .engine
        .download_buffer(&harness.pipeline.positions())
        .unwrap();
    let positions: Vec<[f32; 4]> = bytemuck::pod_collect_to_vec(&positions);
    for (slot, index) in indices.iter().enumerate() {
        let [x, y, z] = draw.vertices[*index as usize];
        assert_eq!(positions[slot], [x, y, z, 1.0], "slot {slot}");
    }
    let pixels = harness.engine.download_image(&harness.color).unwrap();
    let reference = reference_frame(&params, &[draw]);
    assert_eq!(count_differences(&pixels, &reference.to_bytes()), 0);
}

#[test]
fn lit_triangle_uses_interpolated_normals() {
    init_logging();
    let mut engine = CpuEngine::new();
    let mut recording = Recording::default();
    let mut pipeline = PipelineBuilder::new(RasterConfig::default())
        .vertex_attribute(0, 12, VertexFormat::Rgb32Float, "normal")
        .output_layout(OutputLayout { depth: true })
        .build(&mut engine, &mut recording)
        .unwrap();
    let color = pipeline.create_color_target(64, 64);
    let depth = pipeline.create_depth_buffer(64, 64);
    pipeline.set_render_targets(color, Some(depth));

    // Position followed by a normal facing the viewer.
    let vertices: [[f32; 6]; 3] = [
        [-1.0, -1.0, 0.5, 0.0, 0.0, 1.0],
        [3.0, -1.0, 0.5, 0.0, 0.0, 1.0],
        [-1.0, 3.0, 0.5, 0.0, 0.0, 1.0],
    ];
    let vertices = pipeline
        .create_vertex_buffer(&mut recording, bytemuck::cast_slice(&vertices), 3, 24)
        .unwrap();
    let transform = recording.upload_uniform("transform", bytemuck::bytes_of(&Transform::IDENTITY));
    let shading = Shading::lit([1.0; 4], [0.25; 3], [0.5; 3], [0.0, 0.0, -1.0]);
    let shading = recording.upload_uniform("shading", bytemuck::bytes_of(&shading));
    pipeline
        .bind_external_table(
            Stage::Vertex,
            0,
            DescriptorTable::builder("transform").uniform(transform).build(),
        )
        .unwrap();
    pipeline
        .bind_external_table(
            Stage::Pixel,
            0,
            DescriptorTable::builder("shading").uniform(shading).build(),
        )
        .unwrap();
    pipeline.set_vertex_buffer(vertices);
    pipeline.clear_color(color, None);
    pipeline.draw(&mut recording, 3);
    recording.download_image(color);
    recording.download(pipeline.attribute_buffers()[0]);
    engine.run_recording(&recording, "lit").unwrap();

    let normals = engine
        .download_buffer(&pipeline.attribute_buffers()[0])
        .unwrap();
    let normals: Vec<f32> = bytemuck::pod_collect_to_vec(&normals);
    assert_eq!(&normals[..9], &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
    // Ambient 0.25 plus light 0.5 at full intensity.
    let pixels = engine.download_image(&color).unwrap();
    let centre = ((32 * 64 + 32) * 4) as usize;
    assert_eq!(&pixels[centre..centre + 4], &[191, 191, 191, 255]);
}

#[test]
fn full_bin_list_drops_later_pairs() {
    let params = TestParams {
        bin_list_capacity: 16,
        ..TestParams::new("full_list", WIDTH, HEIGHT)
    };
    let mut harness = Harness::cpu(&params).unwrap();
    let frame = harness.render(&[fullscreen(0.5, RED)]).unwrap();
    assert_eq!(frame.counters.bins, 16);
    assert_eq!(frame.bins.len(), 16);
    // Bins are appended row by row, so only the start of the first row is drawn.
    let red = unorm8(RED);
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            let expected = x < 16 * 8 && y < 8;
            assert_eq!(frame.pixel(x, y) == red, expected, "({x}, {y})");
        }
    }
}

#[test]
fn viewport_offsets_the_mapping() {
    let params = TestParams::new("viewport", WIDTH, HEIGHT);
    let mut harness = Harness::cpu(&params).unwrap();
    harness.pipeline.set_viewport(Viewport {
        x: 128.0,
        y: 0.0,
        width: 128.0,
        height: 128.0,
    });
    let frame = harness.render(&[fullscreen(0.5, RED)]).unwrap();
    let red = unorm8(RED);
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            assert_eq!(frame.pixel(x, y) == red, x >= 128, "({x}, {y})");
        }
    }
}

#[test]
fn external_tables_must_match_their_layout() {
    let params = TestParams::new("external_layout", WIDTH, HEIGHT);
    let mut harness = Harness::cpu(&params).unwrap();
    let mut recording = Recording::default();
    let buf = recording.upload("not_a_uniform", vec![0; 16]);
    let table = DescriptorTable::builder("storage").read_only(buf).build();
    let err = harness
        .pipeline
        .bind_external_table(Stage::Pixel, 0, table.clone())
        .unwrap_err();
    assert!(matches!(err, Error::LayoutMismatch { .. }), "{err}");
    let err = harness
        .pipeline
        .bind_external_table(Stage::Vertex, 1, table)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
}

#[test]
fn custom_stage_layouts_have_no_cpu_ports() {
    let mut engine = CpuEngine::new();
    let mut recording = Recording::default();
    let err = PipelineBuilder::new(RasterConfig::default())
        .stage_layout(
            Stage::Pixel,
            vec![vec![BindType::Uniform], vec![BindType::BufReadOnly]],
        )
        .build(&mut engine, &mut recording)
        .err()
        .unwrap();
    assert!(matches!(err, Error::MissingShader(_)), "{err}");
}

#[test]
fn tracked_state_stays_flat_across_frames() {
    let params = params(BinningMode::ThreeLevel);
    let mut harness = Harness::cpu(&params).unwrap();
    harness.render(&scene()).unwrap();
    let tracked = harness.pipeline.resource_states().len();
    for _ in 0..20 {
        harness.render(&scene()).unwrap();
    }
    assert_eq!(harness.pipeline.resource_states().len(), tracked);
}

#[test]
fn freed_targets_are_forgotten() {
    let params = params(BinningMode::TwoLevel);
    let mut harness = Harness::cpu(&params).unwrap();
    harness.render(&scene()).unwrap();
    let tracked = harness.pipeline.resource_states().len();
    // Swap in new targets of the same size, as a resize would.
    for _ in 0..5 {
        let mut recording = Recording::default();
        let old_depth = harness.depth.unwrap();
        harness.pipeline.free_image(&mut recording, harness.color);
        harness.pipeline.free_buffer(&mut recording, old_depth.buffer);
        harness.color = harness.pipeline.create_color_target(WIDTH, HEIGHT);
        let depth = harness.pipeline.create_depth_buffer(WIDTH, HEIGHT);
        harness.depth = Some(depth);
        harness.pipeline.set_render_targets(harness.color, Some(depth));
        harness.engine.run_recording(&recording, "resize").unwrap();
        let frame = harness.render(&scene()).unwrap();
        let reference = reference_frame(&params, &scene());
        assert_eq!(count_differences(&frame.pixels, &reference.to_bytes()), 0);
    }
    assert_eq!(harness.pipeline.resource_states().len(), tracked);
}

fn check_depth_bounds_stay_with_their_pixels(mode: BinningMode) {
    const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];
    let params = params(mode);
    let mut harness = Harness::cpu(&params).unwrap();
    let mut recording = Recording::default();
    harness.pipeline.clear_color(harness.color, None);
    harness.pipeline.clear_depth(harness.depth.unwrap(), None);
    let half = |x| Viewport {
        x,
        y: 0.0,
        width: 128.0,
        height: 128.0,
    };
    // A near wall on the left, a far triangle on the right, then a full-target triangle
    // between the two.
    let draws = [
        (half(0.0), fullscreen(0.1, RED)),
        (half(128.0), fullscreen(0.5, GREEN)),
        (Viewport::new(WIDTH, HEIGHT), fullscreen(0.3, BLUE)),
    ];
    let mut transient = Vec::new();
    for (viewport, draw) in &draws {
        harness.pipeline.set_viewport(*viewport);
        let vertices = harness
            .pipeline
            .create_vertex_buffer(&mut recording, bytemuck::cast_slice(&draw.vertices), 3, 12)
            .unwrap();
        transient.push(vertices.buffer);
        transient.extend(harness.bind_draw_tables(&mut recording, draw).unwrap());
        harness.pipeline.set_vertex_buffer(vertices);
        harness.pipeline.draw(&mut recording, 3);
    }
    recording.download_image(harness.color);
    for buf in transient {
        harness.pipeline.free_buffer(&mut recording, buf);
    }
    harness
        .engine
        .run_recording(&recording, "depth_bounds_per_viewport")
        .unwrap();

    // Only the right half of the last draw survives the wall's bounds.
    let counters = harness.pipeline.read_counters(&mut harness.engine).unwrap();
    let bin_size = params.config().bin_size();
    let right_bins = (WIDTH / 2).div_ceil(bin_size) * HEIGHT.div_ceil(bin_size);
    assert_eq!(counters.bins, right_bins);

    let pixels = harness.engine.download_image(&harness.color).unwrap();
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            let ix = ((y * WIDTH + x) * 4) as usize;
            let expected = if x < WIDTH / 2 { RED } else { BLUE };
            assert_eq!(pixels[ix..ix + 4], unorm8(expected), "({x}, {y})");
        }
    }
}

#[test]
fn depth_bounds_stay_with_their_pixels_two_level() {
    check_depth_bounds_stay_with_their_pixels(BinningMode::TwoLevel);
}

#[test]
fn depth_bounds_stay_with_their_pixels_three_level() {
    check_depth_bounds_stay_with_their_pixels(BinningMode::ThreeLevel);
}
