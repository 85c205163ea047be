// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Random triangles binned and tiled against brute force.
//!
//! Vertices sit on whole pixels of a power of two target, so screen positions are exact and
//! the kernels and the reference make identical decisions.

use std::collections::HashSet;

use compute_raster::{BinningMode, PrimitiveEntry, TILE_SIZE};
use compute_raster_tests::{
    DrawCall, Harness, RED, ScreenTriangle, TestParams, count_differences, ndc, reference_frame,
    reference_pairs,
};
use proptest::prelude::*;

const WIDTH: u32 = 128;
const HEIGHT: u32 = 64;

fn triangles() -> impl Strategy<Value = Vec<[[i32; 2]; 3]>> {
    let vertex = (-32i32..160, -32i32..96).prop_map(|(x, y)| [x, y]);
    prop::collection::vec([vertex.clone(), vertex.clone(), vertex], 1..=8)
}

fn draw_of(triangles: &[[[i32; 2]; 3]]) -> DrawCall {
    let vertices = triangles
        .iter()
        .flatten()
        .map(|[x, y]| ndc(*x as f32, *y as f32, 0.5, WIDTH, HEIGHT))
        .collect();
    DrawCall::flat(vertices, RED)
}

fn sorted(mut entries: Vec<PrimitiveEntry>) -> Vec<(u32, u32)> {
    entries.sort_by_key(|e| (e.triangle, e.region));
    entries.iter().map(|e| (e.triangle, e.region)).collect()
}

fn check_lists(mode: BinningMode, triangles: &[[[i32; 2]; 3]]) -> Result<(), TestCaseError> {
    let params = TestParams {
        mode,
        ..TestParams::new("random_binning", WIDTH, HEIGHT)
    };
    let mut harness = Harness::cpu(&params).unwrap();
    let draw = draw_of(triangles);
    let frame = harness.render(std::slice::from_ref(&draw)).unwrap();
    let clip = draw.clip_triangles();

    let bin_size = params.config().bin_size();
    let expected = reference_pairs(&clip, WIDTH, HEIGHT, bin_size);
    prop_assert_eq!(frame.counters.bins as usize, expected.len());
    prop_assert_eq!(sorted(frame.bins.clone()), sorted(expected));

    let reference = reference_frame(&params, std::slice::from_ref(&draw));
    prop_assert_eq!(count_differences(&frame.pixels, &reference.to_bytes()), 0);

    if mode == BinningMode::ThreeLevel {
        let tiles_x = WIDTH.div_ceil(TILE_SIZE);
        let tiles_y = HEIGHT.div_ceil(TILE_SIZE);
        let bins_x = WIDTH.div_ceil(bin_size);
        let ratio = bin_size / TILE_SIZE;
        let bins: HashSet<_> = frame.bins.iter().map(|e| (e.triangle, e.region)).collect();
        let tiles: HashSet<_> = frame.tiles.iter().map(|e| (e.triangle, e.region)).collect();
        prop_assert_eq!(frame.counters.tiles, Some(frame.tiles.len() as u32));
        prop_assert_eq!(tiles.len(), frame.tiles.len(), "duplicate tile entries");
        for &(triangle, tile) in &tiles {
            prop_assert!(tile < tiles_x * tiles_y);
            let bin = (tile / tiles_x / ratio) * bins_x + (tile % tiles_x) / ratio;
            prop_assert!(bins.contains(&(triangle, bin)), "tile {} outside its bins", tile);
        }
        // Every covered pixel lies in a tile its triangle was listed for.
        let viewport = [0.0, 0.0, WIDTH as f32, HEIGHT as f32];
        for (ix, clip) in clip.iter().enumerate() {
            let Some(tri) = ScreenTriangle::new(*clip, viewport) else {
                continue;
            };
            for y in 0..HEIGHT {
                for x in 0..WIDTH {
                    if tri.sample(x, y).is_some() {
                        let tile = (y / TILE_SIZE) * tiles_x + x / TILE_SIZE;
                        prop_assert!(
                            tiles.contains(&(ix as u32, tile)),
                            "pixel ({}, {}) of triangle {} has no tile",
                            x,
                            y,
                            ix
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn bins_match_brute_force_two_level(triangles in triangles()) {
        check_lists(BinningMode::TwoLevel, &triangles)?;
    }

    #[test]
    fn bins_and_tiles_match_brute_force_three_level(triangles in triangles()) {
        check_lists(BinningMode::ThreeLevel, &triangles)?;
    }
}

#[test]
fn offscreen_triangles_are_not_binned() {
    let params = TestParams::new("offscreen", WIDTH, HEIGHT);
    let mut harness = Harness::cpu(&params).unwrap();
    let draw = draw_of(&[[[-30, -30], [-10, -30], [-30, -10]], [[130, 10], [150, 10], [130, 40]]]);
    let frame = harness.render(&[draw]).unwrap();
    assert_eq!(frame.counters.bins, 0);
    assert!(frame.bins.is_empty());
}

#[test]
fn degenerate_triangles_are_not_binned() {
    let params = TestParams::new("degenerate", WIDTH, HEIGHT);
    let mut harness = Harness::cpu(&params).unwrap();
    let draw = draw_of(&[[[10, 10], [20, 20], [30, 30]], [[5, 5], [5, 5], [40, 9]]]);
    let frame = harness.render(&[draw]).unwrap();
    assert_eq!(frame.counters.bins, 0);
}
