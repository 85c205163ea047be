// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The compute kernels of the [`compute_raster`] pipeline.
//!
//! Kernels are addressed by fixed name (see [`names`]). Each name has a WGSL source under
//! `shader/`, and shared snippets pulled in with `#import` live under `shader/shared/`. Variants
//! are selected with [`preprocess`] defines rather than separate files.
//!
//! With the `cpu` feature (on by default) the [`cpu`] module provides ports of the kernels
//! which read and write the same buffer layouts, for running the pipeline without a GPU.
//!
//! [`compute_raster`]: https://docs.rs/compute_raster

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![cfg_attr(docsrs, feature(doc_cfg))]
// The following lints are part of the Linebender standard set,
// but resolving them has been deferred for now.
// Feel free to send a PR that solves one or more of these.
#![allow(missing_docs, reason = "We have many as-yet undocumented items.")]
#![allow(
    missing_debug_implementations,
    unnameable_types,
    clippy::cast_possible_truncation,
    clippy::missing_assert_message,
    reason = "Deferred, only apply in some feature sets so not expect"
)]

pub mod preprocess;
mod types;

#[cfg(feature = "cpu")]
pub mod cpu;

pub use types::*;

use std::borrow::Cow;

/// Kernel names. A name is also the stem of its source file.
pub mod names {
    pub const VS_STAGE: &str = "vs_stage";
    pub const VS_STAGE_INDEXED: &str = "vs_stage_indexed";
    pub const BIN_RASTER: &str = "bin_raster";
    pub const TILE_RASTER: &str = "tile_raster";
    pub const PIXEL_RASTER: &str = "pixel_raster";
    pub const CLEAR_COLOR: &str = "clear_color";
    pub const CLEAR_DEPTH: &str = "clear_depth";

    pub const ALL: [&str; 7] = [
        VS_STAGE,
        VS_STAGE_INDEXED,
        BIN_RASTER,
        TILE_RASTER,
        PIXEL_RASTER,
        CLEAR_COLOR,
        CLEAR_DEPTH,
    ];
}

/// Preprocessor defines understood by the kernels.
pub mod defines {
    pub const INDEX_U16: &str = "INDEX_U16";
    pub const HAS_DEPTH: &str = "HAS_DEPTH";
    pub const THREE_LEVEL: &str = "THREE_LEVEL";
    pub const DEPTH_PASS: &str = "DEPTH_PASS";
    pub const ATTRIB: [&str; super::MAX_VERTEX_ATTRIBUTES] =
        ["ATTRIB_0", "ATTRIB_1", "ATTRIB_2", "ATTRIB_3"];
}

pub const MAX_VERTEX_ATTRIBUTES: usize = 4;

pub const VERTEX_WG: u32 = 64;
pub const BIN_WG: u32 = 64;
pub const CLEAR_COLOR_WG: (u32, u32) = (8, 8);
pub const CLEAR_DEPTH_WG: u32 = 256;

/// Directory the embedded sources were read from at build time.
pub const SHADER_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/shader");

macro_rules! embed {
    ($dir:literal, $name:literal) => {
        (
            $name,
            include_str!(concat!(env!("CARGO_MANIFEST_DIR"), $dir, $name, ".wgsl")),
        )
    };
}

const KERNELS: &[(&str, &str)] = &[
    embed!("/shader/", "vs_stage"),
    embed!("/shader/", "vs_stage_indexed"),
    embed!("/shader/", "bin_raster"),
    embed!("/shader/", "tile_raster"),
    embed!("/shader/", "pixel_raster"),
    embed!("/shader/", "clear_color"),
    embed!("/shader/", "clear_depth"),
];

const SHARED: &[(&str, &str)] = &[
    embed!("/shader/shared/", "uniforms"),
    embed!("/shader/shared/", "raster"),
    embed!("/shader/shared/", "depth"),
    embed!("/shader/shared/", "vertex"),
];

/// With `hot_reload`, prefers the current file on disk over the embedded copy.
fn reload(path: &str, embedded: &'static str) -> Cow<'static, str> {
    #[cfg(feature = "hot_reload")]
    match std::fs::read_to_string(path) {
        Ok(source) => return Cow::Owned(source),
        Err(e) => log::warn!("failed to reload {path}, using embedded source: {e}"),
    }
    #[cfg(not(feature = "hot_reload"))]
    let _ = path;
    Cow::Borrowed(embedded)
}

/// The source of the kernel `name`, or `None` if there is no such kernel.
pub fn kernel_source(name: &str) -> Option<Cow<'static, str>> {
    let (name, source) = KERNELS.iter().find(|(n, _)| *n == name)?;
    Some(reload(&format!("{SHADER_DIR}/{name}.wgsl"), source))
}

/// Every shared snippet, keyed by its `#import` name.
pub fn shared_sources() -> Vec<(&'static str, Cow<'static, str>)> {
    SHARED
        .iter()
        .map(|(name, source)| (*name, reload(&format!("{SHADER_DIR}/shared/{name}.wgsl"), source)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_name_has_a_source() {
        for name in names::ALL {
            assert!(kernel_source(name).is_some(), "{name}");
        }
        assert!(kernel_source("fine").is_none());
        assert_eq!(shared_sources().len(), 4);
    }
}
