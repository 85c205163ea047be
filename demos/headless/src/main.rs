// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Headless

// The following lints are part of the Linebender standard set,
// but resolving them has been deferred for now.
// Feel free to send a PR that solves one or more of these.
#![allow(
    clippy::cast_possible_truncation,
    clippy::allow_attributes_without_reason
)]

use std::f32::consts::PI;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::{Parser, ValueEnum};
use compute_raster::util::RenderContext;
use compute_raster::{
    BinningMode, CpuEngine, DescriptorTable, Engine, IndexFormat, OutputLayout, PipelineBuilder,
    RasterConfig, Recording, Shading, Stage, Transform, VertexFormat, WgpuEngine,
};

/// Position and normal.
type Vertex = [f32; 6];

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let pixels = if args.use_cpu {
        render(&mut CpuEngine::new(), &args)?
    } else {
        let mut context = RenderContext::new();
        let device_id = pollster::block_on(context.device())
            .ok_or_else(|| anyhow!("No compatible device found"))?;
        let device_handle = &context.devices[device_id];
        let mut engine = WgpuEngine::new(&device_handle.device, &device_handle.queue);
        render(&mut engine, &args)?
    };
    let out_path = &args.out;
    let mut file = File::create(out_path)?;
    let mut png_encoder = png::Encoder::new(&mut file, args.width, args.height);
    png_encoder.set_color(png::ColorType::Rgba);
    png_encoder.set_depth(png::BitDepth::Eight);
    let mut writer = png_encoder.write_header()?;
    writer.write_image_data(&pixels)?;
    writer.finish()?;
    println!("Wrote result ({}x{}) to {out_path:?}", args.width, args.height);
    Ok(())
}

/// A unit sphere of `rings` by `segments` quads, with normals equal to positions.
fn sphere(rings: u32, segments: u32) -> (Vec<Vertex>, Vec<u32>) {
    let mut vertices = Vec::new();
    for r in 0..=rings {
        let theta = PI * r as f32 / rings as f32;
        for s in 0..=segments {
            let phi = 2.0 * PI * s as f32 / segments as f32;
            let p = [
                theta.sin() * phi.cos(),
                theta.cos(),
                theta.sin() * phi.sin(),
            ];
            vertices.push([p[0], p[1], p[2], p[0], p[1], p[2]]);
        }
    }
    let mut indices = Vec::new();
    for r in 0..rings {
        for s in 0..segments {
            let a = r * (segments + 1) + s;
            let b = a + segments + 1;
            indices.extend([a, b, a + 1, a + 1, b, b + 1]);
        }
    }
    (vertices, indices)
}

fn backdrop() -> Vec<Vertex> {
    let corner = |x: f32, y: f32| [x, y, 0.95, 0.0, 0.0, -1.0];
    vec![
        corner(-1.0, -1.0),
        corner(1.0, -1.0),
        corner(1.0, 1.0),
        corner(-1.0, -1.0),
        corner(1.0, 1.0),
        corner(-1.0, 1.0),
    ]
}

fn render<E: Engine>(engine: &mut E, args: &Args) -> Result<Vec<u8>> {
    let config = RasterConfig {
        mode: args.mode.into(),
        ..Default::default()
    };
    let mut recording = Recording::default();
    let mut pipeline = PipelineBuilder::new(config)
        .vertex_attribute(0, 12, VertexFormat::Rgb32Float, "normal")
        .output_layout(OutputLayout { depth: true })
        .build(&mut *engine, &mut recording)?;
    let color = pipeline.create_color_target(args.width, args.height);
    let depth = pipeline.create_depth_buffer(args.width, args.height);
    pipeline.set_render_targets(color, Some(depth));
    pipeline.clear_color(color, None);

    let transform_table = |recording: &mut Recording, transform: &Transform| {
        let buf = recording.upload_uniform("transform", bytemuck::bytes_of(transform));
        (buf, DescriptorTable::builder("transform").uniform(buf).build())
    };
    let shading_table = |recording: &mut Recording, shading: &Shading| {
        let buf = recording.upload_uniform("shading", bytemuck::bytes_of(shading));
        (buf, DescriptorTable::builder("shading").uniform(buf).build())
    };
    let mut transient = Vec::new();

    let backdrop = backdrop();
    let vertices = pipeline.create_vertex_buffer(
        &mut recording,
        bytemuck::cast_slice(&backdrop),
        backdrop.len() as u32,
        24,
    )?;
    let (transform, table) = transform_table(&mut recording, &Transform::IDENTITY);
    pipeline.bind_external_table(Stage::Vertex, 0, table)?;
    let (shading, table) = shading_table(&mut recording, &Shading::flat([0.1, 0.12, 0.2, 1.0]));
    pipeline.bind_external_table(Stage::Pixel, 0, table)?;
    pipeline.set_vertex_buffer(vertices);
    pipeline.draw(&mut recording, backdrop.len() as u32);
    transient.extend([vertices.buffer, transform, shading]);

    let (sphere_vertices, indices) = sphere(args.rings, args.rings * 2);
    let vertices = pipeline.create_vertex_buffer(
        &mut recording,
        bytemuck::cast_slice(&sphere_vertices),
        sphere_vertices.len() as u32,
        24,
    )?;
    let index_buffer = pipeline.create_index_buffer(
        &mut recording,
        bytemuck::cast_slice(&indices),
        indices.len() as u32,
        IndexFormat::Uint32,
    )?;
    // Fits the sphere to the shorter side and maps its depth into [0.1, 0.9].
    let scale = 0.8;
    let aspect = args.height as f32 / args.width as f32;
    let sphere_transform = Transform {
        world_view_proj: [
            [scale * aspect, 0.0, 0.0, 0.0],
            [0.0, scale, 0.0, 0.0],
            [0.0, 0.0, 0.4, 0.0],
            [0.0, 0.0, 0.5, 1.0],
        ],
    };
    let (transform, table) = transform_table(&mut recording, &sphere_transform);
    pipeline.bind_external_table(Stage::Vertex, 0, table)?;
    let light = {
        let d: [f32; 3] = [1.0, -1.0, 1.0];
        let len = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
        d.map(|c| c / len)
    };
    let lit = Shading::lit([0.9, 0.35, 0.2, 1.0], [0.15; 3], [1.0; 3], light);
    let (shading, table) = shading_table(&mut recording, &lit);
    pipeline.bind_external_table(Stage::Pixel, 0, table)?;
    pipeline.set_vertex_buffer(vertices);
    pipeline.set_index_buffer(index_buffer);
    pipeline.draw_indexed(&mut recording, indices.len() as u32);
    transient.extend([vertices.buffer, index_buffer.buffer, transform, shading]);

    recording.download_image(color);
    for buf in transient {
        pipeline.free_buffer(&mut recording, buf);
    }
    engine.run_recording(&recording, "headless")?;
    let counters = pipeline.read_counters(&mut *engine)?;
    log::info!(
        "{} bin entries, {:?} tile entries in the last draw",
        counters.bins,
        counters.tiles
    );
    let pixels = engine.download_image(&color)?;

    let mut recording = Recording::default();
    pipeline.free_image(&mut recording, color);
    pipeline.free_buffer(&mut recording, depth.buffer);
    pipeline.release(&mut recording);
    engine.run_recording(&recording, "headless.release")?;
    Ok(pixels)
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Triangles are binned straight into tiles.
    Two,
    /// Triangles are binned into large bins, then into tiles.
    Three,
}

impl From<Mode> for BinningMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Two => Self::TwoLevel,
            Mode::Three => Self::ThreeLevel,
        }
    }
}

#[derive(Parser, Debug)]
#[command(about, long_about = None, bin_name="cargo run -p headless --")]
struct Args {
    #[arg(long, short = 'x', default_value_t = 800)]
    width: u32,
    #[arg(long, short = 'y', default_value_t = 600)]
    height: u32,
    /// Binning hierarchy
    #[arg(long, value_enum, default_value_t = Mode::Three)]
    mode: Mode,
    /// Latitude subdivisions of the sphere
    #[arg(long, default_value_t = 24)]
    rings: u32,
    /// Where to write the PNG
    #[arg(long, default_value_os_t = default_output())]
    out: PathBuf,
    #[arg(long)]
    /// Run the CPU ports of the kernels instead of a GPU
    use_cpu: bool,
}

fn default_output() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("sphere.png")
}
