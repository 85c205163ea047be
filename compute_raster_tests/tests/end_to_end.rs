// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A single right triangle rendered into an 800x600 target.

use compute_raster::{BinningMode, CLEAR_COLOR, Engine};
use compute_raster_tests::{
    DrawCall, Harness, RED, TestParams, count_differences, depth_bits, ndc, reference_frame,
    unorm8,
};

const WIDTH: u32 = 800;
const HEIGHT: u32 = 600;

fn right_triangle() -> DrawCall {
    let v = |x, y| ndc(x, y, 0.25, WIDTH, HEIGHT);
    DrawCall::flat(vec![v(100., 100.), v(200., 100.), v(100., 200.)], RED)
}

fn params(mode: BinningMode) -> TestParams {
    TestParams {
        mode,
        depth: true,
        ..TestParams::new("right_triangle", WIDTH, HEIGHT)
    }
}

fn right_triangle_covers_its_pixels<E: Engine>(mut harness: Harness<E>, params: &TestParams) {
    let draw = right_triangle();
    let frame = harness.render(std::slice::from_ref(&draw)).unwrap();
    let reference = reference_frame(params, &[draw]);
    assert_eq!(count_differences(&frame.pixels, &reference.to_bytes()), 0);

    let red = unorm8(RED);
    let clear = unorm8(CLEAR_COLOR.components);
    let mut covered = 0;
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            let pixel = frame.pixel(x, y);
            let depth = frame.depth_at(x, y).unwrap();
            if pixel == red {
                assert!(
                    (100..200).contains(&x) && (100..200).contains(&y),
                    "({x}, {y}) is outside the triangle"
                );
                assert_eq!(depth_bits(depth), reference.depth[(y * WIDTH + x) as usize]);
                assert!((depth - 0.25).abs() < 1e-6, "{depth} at ({x}, {y})");
                covered += 1;
            } else {
                assert_eq!(pixel, clear, "({x}, {y})");
                assert_eq!(depth, 1.0, "({x}, {y})");
            }
        }
    }
    // Pixels with x + y <= 299, give or take rounding along the hypotenuse.
    assert!((4950..=5150).contains(&covered), "{covered} pixels covered");
    assert!(frame.counters.bins > 0);
}

#[test]
fn right_triangle_two_level() {
    let params = params(BinningMode::TwoLevel);
    right_triangle_covers_its_pixels(Harness::cpu(&params).unwrap(), &params);
}

#[test]
fn right_triangle_three_level() {
    let params = params(BinningMode::ThreeLevel);
    right_triangle_covers_its_pixels(Harness::cpu(&params).unwrap(), &params);
}

#[test]
fn triangle_inside_one_bin_gives_one_pair() {
    let params = TestParams {
        mode: BinningMode::ThreeLevel,
        ..TestParams::new("one_bin", WIDTH, HEIGHT)
    };
    let mut harness = Harness::cpu(&params).unwrap();
    let v = |x, y| ndc(x, y, 0.5, WIDTH, HEIGHT);
    // Bin (1, 1) spans pixels 64..128.
    let draw = DrawCall::flat(vec![v(70., 70.), v(120., 70.), v(70., 120.)], RED);
    let frame = harness.render(&[draw]).unwrap();
    assert_eq!(frame.bins.len(), 1);
    assert_eq!(frame.bins[0].region, 13 + 1);
    assert_eq!(frame.counters.bins, 1);
}

#[test]
fn fullscreen_triangle_touches_every_bin_once() {
    let params = TestParams::new("every_bin", WIDTH, HEIGHT);
    let mut harness = Harness::cpu(&params).unwrap();
    let draw = DrawCall::flat(
        vec![[-1.0, -1.0, 0.5], [3.0, -1.0, 0.5], [-1.0, 3.0, 0.5]],
        RED,
    );
    let frame = harness.render(&[draw]).unwrap();
    let mut regions: Vec<_> = frame.bins.iter().map(|e| e.region).collect();
    regions.sort_unstable();
    let expected: Vec<u32> = (0..100 * 75).collect();
    assert_eq!(regions, expected);
    assert!(frame.pixels.chunks_exact(4).all(|p| p == unorm8(RED)));
}

#[test]
#[ignore = "requires a GPU adapter"]
fn right_triangle_two_level_gpu() {
    let params = params(BinningMode::TwoLevel);
    right_triangle_covers_its_pixels(Harness::gpu(&params).unwrap(), &params);
}

#[test]
#[ignore = "requires a GPU adapter"]
fn right_triangle_three_level_gpu() {
    let params = params(BinningMode::ThreeLevel);
    right_triangle_covers_its_pixels(Harness::gpu(&params).unwrap(), &params);
}
