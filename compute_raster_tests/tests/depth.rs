// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Overlapping triangles resolved by the depth test.

use compute_raster::{BinningMode, Engine, TILE_SIZE};
use compute_raster_tests::{
    DrawCall, GREEN, Harness, RED, TestParams, count_differences, ndc, reference_frame, unorm8,
};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

fn near() -> DrawCall {
    let v = |x, y| ndc(x, y, 0.3, WIDTH, HEIGHT);
    DrawCall::flat(vec![v(40., 30.), v(250., 50.), v(60., 220.)], RED)
}

fn far() -> DrawCall {
    let v = |x, y| ndc(x, y, 0.6, WIDTH, HEIGHT);
    DrawCall::flat(vec![v(100., 20.), v(300., 200.), v(20., 180.)], GREEN)
}

fn nearer_triangle_wins<E: Engine>(mut harness: Harness<E>, params: &TestParams) {
    for draws in [[near(), far()], [far(), near()]] {
        let frame = harness.render(&draws).unwrap();
        let reference = reference_frame(params, &draws);
        assert_eq!(count_differences(&frame.pixels, &reference.to_bytes()), 0);
        // Inside both triangles.
        assert_eq!(frame.pixel(120, 100), unorm8(RED));
        // Only inside the far one.
        assert_eq!(frame.pixel(250, 180), unorm8(GREEN));
        let depth = frame.depth_at(120, 100).unwrap();
        assert!((depth - 0.3).abs() < 1e-6, "{depth}");
        let depth = frame.depth_at(250, 180).unwrap();
        assert!((depth - 0.6).abs() < 1e-6, "{depth}");
    }
}

fn params(mode: BinningMode) -> TestParams {
    TestParams {
        mode,
        depth: true,
        ..TestParams::new("depth_order", WIDTH, HEIGHT)
    }
}

#[test]
fn nearer_triangle_wins_two_level() {
    let params = params(BinningMode::TwoLevel);
    nearer_triangle_wins(Harness::cpu(&params).unwrap(), &params);
}

#[test]
fn nearer_triangle_wins_three_level() {
    let params = params(BinningMode::ThreeLevel);
    nearer_triangle_wins(Harness::cpu(&params).unwrap(), &params);
}

#[test]
fn one_draw_resolves_its_own_overlaps() {
    let params = params(BinningMode::ThreeLevel);
    let mut harness = Harness::cpu(&params).unwrap();
    let mut vertices = far().vertices;
    vertices.extend(near().vertices);
    let draw = DrawCall::flat(vertices, RED);
    let frame = harness.render(std::slice::from_ref(&draw)).unwrap();
    let reference = reference_frame(&params, &[draw]);
    assert_eq!(count_differences(&frame.pixels, &reference.to_bytes()), 0);
    let depth = frame.depth_at(120, 100).unwrap();
    assert!((depth - 0.3).abs() < 1e-6, "{depth}");
}

/// Covers the whole target in front of everything else.
fn wall() -> DrawCall {
    DrawCall::flat(
        vec![[-1.0, -1.0, 0.1], [3.0, -1.0, 0.1], [-1.0, 3.0, 0.1]],
        RED,
    )
}

fn hidden_regions_are_culled(mode: BinningMode) {
    let params = params(mode);
    let mut harness = Harness::cpu(&params).unwrap();
    let frame = harness.render(&[wall(), far()]).unwrap();
    // Every region of the far triangle is behind the wall's bounds.
    assert_eq!(frame.counters.bins, 0);
    if mode == BinningMode::ThreeLevel {
        assert_eq!(frame.counters.tiles, Some(0));
    }
    assert!(frame.pixels.chunks_exact(4).all(|p| p == unorm8(RED)));
}

#[test]
fn hierarchical_depth_culls_hidden_bins() {
    hidden_regions_are_culled(BinningMode::TwoLevel);
}

#[test]
fn hierarchical_depth_culls_hidden_bins_and_tiles() {
    hidden_regions_are_culled(BinningMode::ThreeLevel);
}

#[test]
fn only_fully_covered_regions_are_culled() {
    let params = params(BinningMode::ThreeLevel);
    let mut harness = Harness::cpu(&params).unwrap();
    // Covers every pixel left of x = 100, so bin column 0 and tile columns 0 to 11 are fully
    // covered while bin column 1 and tile column 12 are only partly covered.
    let v = |x, y| ndc(x, y, 0.1, WIDTH, HEIGHT);
    let strip = DrawCall::flat(vec![v(-200., -10.), v(100., -10.), v(100., 500.)], RED);
    let draws = [strip, far()];
    let frame = harness.render(&draws).unwrap();
    let reference = reference_frame(&params, &draws);
    assert_eq!(count_differences(&frame.pixels, &reference.to_bytes()), 0);

    let bin_size = params.config().bin_size();
    let bins_x = WIDTH.div_ceil(bin_size);
    let tiles_x = WIDTH.div_ceil(TILE_SIZE);
    assert!(frame.bins.iter().all(|e| e.region % bins_x != 0));
    assert!(frame.bins.iter().any(|e| e.region % bins_x == 1));
    assert!(!frame.tiles.is_empty());
    assert!(frame.tiles.iter().all(|e| e.region % tiles_x >= 12));
    assert!(frame.tiles.iter().any(|e| e.region % tiles_x == 12));
}

#[test]
#[ignore = "requires a GPU adapter"]
fn nearer_triangle_wins_gpu() {
    let params = params(BinningMode::ThreeLevel);
    nearer_triangle_wins(Harness::gpu(&params).unwrap(), &params);
}
