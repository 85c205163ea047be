// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Load the raster kernels and register the variants a pipeline needs.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use compute_raster_shaders::preprocess::{self, Imports, PreprocessError, PreprocessErrorKind};
use compute_raster_shaders::{defines, names};

use crate::engine::{Engine, ShaderDesc};
use crate::recording::{BindType, ImageFormat, ShaderId};
use crate::{Error, Result};

/// Where kernel sources come from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ShaderSource {
    /// The sources compiled into `compute_raster_shaders`.
    #[default]
    Embedded,
    /// `<path>/<name>.wgsl` for every kernel, with `#import`s resolved against
    /// `<path>/shared/*.wgsl`. Read when the pipeline is built.
    Directory(PathBuf),
}

/// Bind group layouts of the tables an application binds ahead of a stage's own tables.
///
/// The built-in kernels expect one group holding a uniform in each stage: a
/// [`Transform`](compute_raster_shaders::Transform) for the vertex stage and a
/// [`Shading`](compute_raster_shaders::Shading) for the pixel stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageLayouts {
    pub vertex: Vec<Vec<BindType>>,
    pub pixel: Vec<Vec<BindType>>,
}

impl Default for StageLayouts {
    fn default() -> Self {
        Self {
            vertex: vec![vec![BindType::Uniform]],
            pixel: vec![vec![BindType::Uniform]],
        }
    }
}

/// Shape of the pipeline the kernels are specialized for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Variant {
    pub three_level: bool,
    pub depth: bool,
    pub num_attributes: usize,
}

/// The kernels of one pipeline.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RasterShaders {
    pub vs_stage: ShaderId,
    pub vs_stage_indexed_u16: ShaderId,
    pub vs_stage_indexed_u32: ShaderId,
    pub bin_raster: ShaderId,
    pub tile_raster: Option<ShaderId>,
    pub pixel_depth: Option<ShaderId>,
    pub pixel_raster: ShaderId,
    pub clear_color: ShaderId,
    pub clear_depth: ShaderId,
}

/// Kernel sources and the shared snippets they import.
struct Sources {
    kernels: HashMap<&'static str, Cow<'static, str>>,
    shared: Vec<(String, Cow<'static, str>)>,
}

impl Sources {
    fn load(source: &ShaderSource) -> Result<Self> {
        match source {
            ShaderSource::Embedded => {
                let kernels = names::ALL
                    .iter()
                    .filter_map(|name| Some((*name, compute_raster_shaders::kernel_source(name)?)))
                    .collect();
                let shared = compute_raster_shaders::shared_sources()
                    .into_iter()
                    .map(|(name, source)| (name.to_owned(), source))
                    .collect();
                Ok(Self { kernels, shared })
            }
            ShaderSource::Directory(dir) => Self::read_dir(dir),
        }
    }

    fn read_dir(dir: &Path) -> Result<Self> {
        let mut kernels = HashMap::new();
        for name in names::ALL {
            let path = dir.join(format!("{name}.wgsl"));
            let source = std::fs::read_to_string(&path).map_err(|source| Error::ShaderLoad {
                name: path.display().to_string(),
                source,
            })?;
            kernels.insert(name, Cow::Owned(source));
        }
        let shared_dir = dir.join("shared");
        let entries = std::fs::read_dir(&shared_dir).map_err(|source| Error::ShaderLoad {
            name: shared_dir.display().to_string(),
            source,
        })?;
        let mut shared = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| Error::ShaderLoad {
                    name: shared_dir.display().to_string(),
                    source,
                })?
                .path();
            if path.extension().is_none_or(|ext| ext != "wgsl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = std::fs::read_to_string(&path).map_err(|source| Error::ShaderLoad {
                name: path.display().to_string(),
                source,
            })?;
            shared.push((stem.to_owned(), Cow::Owned(source)));
        }
        log::debug!(
            "loaded {} kernels and {} shared sources from {}",
            kernels.len(),
            shared.len(),
            dir.display()
        );
        Ok(Self { kernels, shared })
    }

    fn imports(&self) -> Imports<'_> {
        self.shared
            .iter()
            .map(|(name, source)| (name.as_str(), source.as_ref()))
            .collect()
    }

    fn expand(&self, name: &'static str, defines: &[&str]) -> Result<String> {
        let source = self
            .kernels
            .get(name)
            .ok_or_else(|| Error::MissingShader(name.to_owned()))?;
        let defines: HashSet<&str> = defines.iter().copied().collect();
        preprocess::preprocess(source, name, &defines, &self.imports()).map_err(preprocess_error)
    }
}

fn preprocess_error(error: PreprocessError) -> Error {
    match error.kind {
        PreprocessErrorKind::UnknownImport(import) => Error::UnknownImport {
            shader: error.shader,
            import,
        },
        _ => Error::Preprocess(error),
    }
}

impl RasterShaders {
    /// Preprocesses and registers every kernel variant `variant` needs.
    ///
    /// CPU ports are attached only to the embedded kernels with the default stage layouts,
    /// since the ports read their resources in that order.
    pub(crate) fn new<E: Engine + ?Sized>(
        engine: &mut E,
        source: &ShaderSource,
        layouts: &StageLayouts,
        variant: Variant,
    ) -> Result<Self> {
        use BindType::*;

        let sources = Sources::load(source)?;
        #[cfg(feature = "cpu")]
        let cpu_ports = *source == ShaderSource::Embedded && *layouts == StageLayouts::default();

        macro_rules! add_shader {
            ($name:expr, $label:literal, $defines:expr, $layout:expr, $cpu:ident) => {{
                let wgsl = sources.expand($name, &$defines)?;
                engine.add_shader(ShaderDesc {
                    label: concat!("compute_raster.", $label),
                    wgsl: Cow::Owned(wgsl),
                    layout: $layout,
                    #[cfg(feature = "cpu")]
                    cpu: cpu_ports.then_some(
                        compute_raster_shaders::cpu::$cpu as crate::engine::CpuShaderFn,
                    ),
                })?
            }};
        }

        let attrib_defines: &[&str] = &defines::ATTRIB[..variant.num_attributes];
        let attrib_group = (variant.num_attributes > 0).then(|| vec![Buffer; variant.num_attributes]);
        let depth = |mut group: Vec<BindType>| {
            if variant.depth {
                group.push(Buffer);
            }
            group
        };
        let mut raster_defines = Vec::new();
        if variant.depth {
            raster_defines.push(defines::HAS_DEPTH);
        }
        if variant.three_level {
            raster_defines.push(defines::THREE_LEVEL);
        }

        let vertex_layout = |internal: Vec<BindType>| {
            let mut layout = layouts.vertex.clone();
            layout.push(internal);
            layout.extend(attrib_group.clone());
            layout
        };
        let vs_stage = add_shader!(
            names::VS_STAGE,
            "vs_stage",
            attrib_defines.to_vec(),
            vertex_layout(vec![Uniform, BufReadOnly, Buffer]),
            vs_stage
        );
        let indexed_layout = vertex_layout(vec![Uniform, BufReadOnly, BufReadOnly, Buffer]);
        let vs_stage_indexed_u16 = add_shader!(
            names::VS_STAGE_INDEXED,
            "vs_stage_indexed_u16",
            [attrib_defines, &[defines::INDEX_U16][..]].concat(),
            indexed_layout.clone(),
            vs_stage_indexed
        );
        let vs_stage_indexed_u32 = add_shader!(
            names::VS_STAGE_INDEXED,
            "vs_stage_indexed_u32",
            attrib_defines.to_vec(),
            indexed_layout,
            vs_stage_indexed
        );
        let bin_raster = add_shader!(
            names::BIN_RASTER,
            "bin_raster",
            raster_defines.clone(),
            vec![depth(vec![Uniform, BufReadOnly, Buffer, Buffer])],
            bin_raster
        );
        let tile_raster = if variant.three_level {
            Some(add_shader!(
                names::TILE_RASTER,
                "tile_raster",
                raster_defines.clone(),
                vec![depth(vec![Uniform, BufReadOnly, BufReadOnly, Buffer, Buffer])],
                tile_raster
            ))
        } else {
            None
        };
        let pixel_depth = if variant.depth {
            let mut layout = layouts.pixel.clone();
            layout.push(vec![Uniform, BufReadOnly, BufReadOnly, Buffer]);
            Some(add_shader!(
                names::PIXEL_RASTER,
                "pixel_depth",
                [raster_defines.as_slice(), &[defines::DEPTH_PASS][..]].concat(),
                layout,
                pixel_depth
            ))
        } else {
            None
        };
        let mut pixel_layout = layouts.pixel.clone();
        pixel_layout.push(depth(vec![Uniform, BufReadOnly, BufReadOnly, Image(ImageFormat::Rgba8)]));
        let mut pixel_defines = raster_defines;
        if variant.num_attributes > 0 {
            // Only the first attribute is read, as the surface normal.
            pixel_layout.push(vec![BufReadOnly]);
            pixel_defines.push(defines::ATTRIB[0]);
        }
        let pixel_raster = add_shader!(
            names::PIXEL_RASTER,
            "pixel_raster",
            pixel_defines,
            pixel_layout,
            pixel_raster
        );
        let clear_color = add_shader!(
            names::CLEAR_COLOR,
            "clear_color",
            Vec::<&str>::new(),
            vec![vec![Uniform, Image(ImageFormat::Rgba8)]],
            clear_color
        );
        let clear_depth = add_shader!(
            names::CLEAR_DEPTH,
            "clear_depth",
            Vec::<&str>::new(),
            vec![vec![Uniform, Buffer]],
            clear_depth
        );
        Ok(Self {
            vs_stage,
            vs_stage_indexed_u16,
            vs_stage_indexed_u32,
            bin_raster,
            tile_raster,
            pixel_depth,
            pixel_raster,
            clear_color,
            clear_depth,
        })
    }
}
