// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The barriers a frame records, checked from outside the pipeline.

use std::collections::HashMap;

use compute_raster::{
    Barrier, BinningMode, Command, Engine, Error, ResourceId, ResourceState,
};
use compute_raster_tests::{DrawCall, Harness, RED, TestParams, ndc};

const WIDTH: u32 = 256;
const HEIGHT: u32 = 128;

fn triangle() -> DrawCall {
    let v = |x, y| ndc(x, y, 0.5, WIDTH, HEIGHT);
    DrawCall::flat(vec![v(10., 10.), v(200., 30.), v(40., 120.)], RED)
}

fn params(mode: BinningMode) -> TestParams {
    TestParams {
        mode,
        depth: true,
        ..TestParams::new("barriers", WIDTH, HEIGHT)
    }
}

fn check_transitions_before_use(mode: BinningMode) {
    let params = params(mode);
    let mut harness = Harness::cpu(&params).unwrap();
    // The second frame starts with the counters left as indirect arguments.
    harness.render(&[triangle()]).unwrap();
    let recording = harness.record_frame(&[triangle(), triangle()]).unwrap();

    let mut states: HashMap<ResourceId, ResourceState> = HashMap::new();
    let mut indirect_dispatches = 0;
    let mut copies = 0;
    for command in &recording.commands {
        match command {
            Command::Barrier(barriers) => {
                for barrier in barriers {
                    if let Barrier::Transition {
                        resource, after, ..
                    } = barrier
                    {
                        states.insert(resource.id(), *after);
                    }
                }
            }
            Command::DispatchIndirect(_, args, _, _) => {
                assert_eq!(
                    states.get(&args.id),
                    Some(&ResourceState::IndirectArgument),
                    "'{}' used as indirect arguments",
                    args.name
                );
                indirect_dispatches += 1;
            }
            Command::CopyBuffer { src, dst, .. } => {
                assert_eq!(
                    states.get(&dst.id),
                    Some(&ResourceState::CopyDest),
                    "'{}' copied into",
                    dst.name
                );
                assert_ne!(states.get(&src.id), Some(&ResourceState::UnorderedAccess));
                copies += 1;
            }
            _ => {}
        }
    }
    let per_draw = match mode {
        // Depth pass and color pass.
        BinningMode::TwoLevel => 2,
        // Tiling, then both pixel passes.
        BinningMode::ThreeLevel => 3,
    };
    assert_eq!(indirect_dispatches, 2 * per_draw);
    assert!(copies >= 2, "every draw resets its counters");

    harness
        .engine
        .run_recording(&recording, "transitions_before_use")
        .unwrap();
}

#[test]
fn indirect_arguments_are_transitioned_two_level() {
    check_transitions_before_use(BinningMode::TwoLevel);
}

#[test]
fn indirect_arguments_are_transitioned_three_level() {
    check_transitions_before_use(BinningMode::ThreeLevel);
}

#[test]
fn frames_without_barriers_are_rejected() {
    let params = params(BinningMode::ThreeLevel);
    let mut harness = Harness::cpu(&params).unwrap();
    let mut recording = harness.record_frame(&[triangle()]).unwrap();
    recording
        .commands
        .retain(|command| !matches!(command, Command::Barrier(_)));
    let err = harness
        .engine
        .run_recording(&recording, "no_barriers")
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::MissingBarrier { .. } | Error::InvalidResourceState { .. }
        ),
        "{err}"
    );
}

#[test]
fn counters_end_as_indirect_arguments() {
    let params = params(BinningMode::ThreeLevel);
    let mut harness = Harness::cpu(&params).unwrap();
    harness.render(&[triangle()]).unwrap();
    let lists = harness.pipeline.primitive_lists();
    let states = harness.pipeline.resource_states();
    for counter in [Some(lists.bin_counter), lists.tile_counter].into_iter().flatten() {
        assert_eq!(states.state(counter.id), ResourceState::IndirectArgument);
        assert!(!states.has_pending_writes(counter.id));
    }
}
