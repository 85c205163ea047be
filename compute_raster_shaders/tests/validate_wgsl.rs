// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Every kernel variant the pipeline can request must preprocess, parse and validate.

use std::collections::HashSet;

use compute_raster_shaders::defines::{ATTRIB, DEPTH_PASS, HAS_DEPTH, INDEX_U16, THREE_LEVEL};
use compute_raster_shaders::preprocess::{Imports, preprocess};
use compute_raster_shaders::{kernel_source, names, shared_sources};

fn validate(name: &str, variant: &[&str]) {
    let shared = shared_sources();
    let imports: Imports<'_> = shared.iter().map(|(n, s)| (*n, s.as_ref())).collect();
    let source = kernel_source(name).unwrap();
    let defines: HashSet<&str> = variant.iter().copied().collect();
    let wgsl = preprocess(&source, name, &defines, &imports)
        .unwrap_or_else(|err| panic!("{name} {variant:?}: {err}"));

    let module = naga::front::wgsl::parse_str(&wgsl).unwrap_or_else(|err| {
        panic!(
            "{name} {variant:?} WGSL parse failed: {}",
            err.emit_to_string(&wgsl)
        )
    });
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::empty(),
    );
    validator
        .validate(&module)
        .unwrap_or_else(|err| panic!("{name} {variant:?} WGSL validation failed: {err:?}"));
    assert!(
        module.entry_points.iter().any(|e| e.name == "main"),
        "{name} has no `main` entry point"
    );
}

#[test]
fn vertex_variants() {
    validate(names::VS_STAGE, &[]);
    validate(names::VS_STAGE, &[ATTRIB[0]]);
    validate(names::VS_STAGE, &ATTRIB);
    validate(names::VS_STAGE_INDEXED, &[]);
    validate(names::VS_STAGE_INDEXED, &[INDEX_U16]);
    validate(names::VS_STAGE_INDEXED, &[INDEX_U16, ATTRIB[0], ATTRIB[1]]);
}

#[test]
fn binning_variants() {
    validate(names::BIN_RASTER, &[]);
    validate(names::BIN_RASTER, &[HAS_DEPTH]);
    validate(names::TILE_RASTER, &[]);
    validate(names::TILE_RASTER, &[HAS_DEPTH]);
}

#[test]
fn pixel_variants() {
    validate(names::PIXEL_RASTER, &[]);
    validate(names::PIXEL_RASTER, &[THREE_LEVEL]);
    validate(names::PIXEL_RASTER, &[ATTRIB[0]]);
    validate(names::PIXEL_RASTER, &[HAS_DEPTH]);
    validate(names::PIXEL_RASTER, &[HAS_DEPTH, DEPTH_PASS]);
    validate(names::PIXEL_RASTER, &[HAS_DEPTH, DEPTH_PASS, THREE_LEVEL]);
    validate(names::PIXEL_RASTER, &[HAS_DEPTH, THREE_LEVEL, ATTRIB[0], ATTRIB[1]]);
}

#[test]
fn clear_kernels() {
    validate(names::CLEAR_COLOR, &[]);
    validate(names::CLEAR_DEPTH, &[]);
}
