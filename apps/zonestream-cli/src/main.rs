use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::Vec3;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use zonestream_common::{CameraAngles, Tint, ZONE_UNITS};
use zonestream_jobs::{JobSystem, JobSystemConfig};
use zonestream_model::{ModelData, Placement, upload_dynamic};
use zonestream_render::{RecordingSink, RenderView};
use zonestream_scene::{NoOverrides, PlacedModel, Scene};
use zonestream_sort::FacePrioritySorter;
use zonestream_stream::{Stage, StreamConfig, ViewId, ZoneStreamer};

#[derive(Parser)]
#[command(name = "zonestream-cli", about = "Drive the zone streamer against synthetic scenes")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// JSON file with `jobs` and `stream` sections
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crate info and the effective configuration
    Info,
    /// Load a scene, then walk the window east one zone per step
    Stream {
        /// Number of one-zone moves after the first load
        #[arg(short, long, default_value = "4")]
        steps: i32,
        /// Models placed in every zone
        #[arg(short, long, default_value = "3")]
        per_zone: u32,
        /// Frames simulated between moves
        #[arg(short, long, default_value = "30")]
        frames: u32,
    },
    /// Sort a synthetic face list and check the draw order
    Sort {
        /// Number of faces
        #[arg(short, long, default_value = "16")]
        faces: u32,
        /// Assign priority classes to faces
        #[arg(short, long)]
        priorities: bool,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    jobs: JobSystemConfig,
    stream: StreamConfig,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CliConfig> {
    let Some(path) = path else {
        return Ok(CliConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

/// Deterministic scatter for synthetic content.
fn scatter(i: u32, modulo: u32) -> u32 {
    i.wrapping_mul(2_654_435_761) % modulo
}

/// A window of a synthetic world. Models are keyed by world zone, so
/// windows at different bases agree wherever they overlap.
fn synthetic_scene(base_x: i32, size: usize, per_zone: u32) -> anyhow::Result<Scene> {
    let mut scene = Scene::new(base_x, 0, size)?;
    let span = ZONE_UNITS as u32 - 128;
    for x in 0..size as i32 {
        for z in 0..size as i32 {
            let world = scene.world_zone(x, z);
            let seed = (world.x as u32).wrapping_mul(7919) ^ (world.z as u32).wrapping_mul(104_729);
            for i in 0..per_zone {
                let s = seed.wrapping_add(i);
                let offset = Vec3::new(
                    64.0 + scatter(s, span) as f32,
                    0.0,
                    64.0 + scatter(s.wrapping_add(17), span) as f32,
                );
                let transparency = if scatter(s, 5) == 0 { 120 } else { 0 };
                let id = ((world.x as u64 & 0xffff) << 32) | ((world.z as u64 & 0xffff) << 16) | i as u64;
                let model = ModelData::cuboid(id, 40.0, 96.0, scatter(s, 0xffff) as i32, transparency);
                let placed = PlacedModel::new(Arc::new(model), Scene::zone_origin(x, z) + offset, 0)
                    .with_orientation(scatter(s, 4) as i32 * 512);
                scene.add_model(placed)?;
            }
        }
        if x % 4 == 0 {
            scene.fill_roof(1, (x * 8, 0), (x * 8 + 3, 3), x + 1)?;
        }
    }
    Ok(scene)
}

fn run_stream(config: CliConfig, steps: i32, per_zone: u32, frames: u32) -> anyhow::Result<()> {
    let grid = config.stream.grid_zones;
    let system = Arc::new(JobSystem::new(config.jobs)?);
    let sink = Arc::new(RecordingSink::new());
    let mut streamer = ZoneStreamer::new(
        config.stream,
        system.clone(),
        sink.clone(),
        Arc::new(NoOverrides),
    );
    println!("Streaming {grid}x{grid} zones on {} workers", system.worker_count());

    let dynamic = ModelData::cuboid(u64::MAX, 24.0, 48.0, 0x7a31, 90);
    let centre = (grid / 2) as i32;
    let dt = 1.0 / 60.0;

    for step in 0..=steps {
        let scene = synthetic_scene(step * 8, grid, per_zone)?;
        let stats = streamer.reload_scene(scene)?;
        streamer.swap_scene()?;
        println!(
            "step {step}: reused={} deferred={} queued={} staggered={} stagger={}",
            stats.reused, stats.deferred, stats.queued, stats.staggered, stats.stagger
        );

        for frame in 0..frames {
            streamer.update(dt);

            let eye = Scene::zone_origin(centre, centre) + Vec3::new(512.0, 800.0, 512.0);
            let view = RenderView {
                eye,
                angles: CameraAngles::new(frame as i32 * 8, 256),
            };
            streamer.reassign_multizone_alpha(ViewId::Root, eye)?;
            streamer.sort_static_alpha(ViewId::Root, &view)?;

            let frame_sink = sink.clone();
            let angles = view.angles;
            streamer.queue_renderable(ViewId::Root, &dynamic, (centre, centre), move |ctx, model| {
                let placement = Placement::at(eye - Vec3::new(0.0, 800.0, 0.0));
                let sink = frame_sink.as_ref();
                if let Err(err) = upload_dynamic(ctx, sink, model, placement, angles, Tint::NONE, false) {
                    tracing::warn!(error = %err, "dynamic upload failed");
                }
            })?;
            streamer.ensure_async_uploads_complete(Some((ViewId::Root, centre, centre)))?;

            streamer.post_alpha_pass(ViewId::Root)?;
            sink.end_frame();
        }

        let root = streamer.root();
        let baked = root.zones().filter(|(_, zone)| zone.initialized).count();
        println!(
            "  after {frames} frames: baked={baked}/{} pending_bakes={} buffers={}",
            grid * grid,
            root.pending_bakes(),
            sink.live_buffers()
        );
    }

    let stolen = streamer.ensure_zones_complete(ViewId::Root)?;
    streamer.update(dt);
    println!("settled: stolen={stolen} buffers={}", sink.live_buffers());
    println!("{}", streamer.timings().summary());
    tracing::debug!(
        scene_load = ?streamer.timings().average(Stage::SceneLoad),
        swap = ?streamer.timings().average(Stage::Swap),
        "average stage times"
    );
    Ok(())
}

fn run_sort(faces: u32, priorities: bool) {
    let visible: Vec<u32> = (0..faces).collect();
    let depths: Vec<i32> = (0..faces).map(|i| scatter(i, 500) as i32).collect();
    let classes: Vec<u8> = (0..faces).map(|i| scatter(i + 3, 12) as u8).collect();
    let classes = priorities.then_some(classes.as_slice());

    let mut sorter = FacePrioritySorter::new();
    let order = sorter.sort_faces(&visible, &depths, classes).to_vec();
    println!("Sorted {} of {faces} faces (priorities={priorities})", order.len());
    for face in order.iter().take(16) {
        let class = classes.map(|c| c[*face as usize]);
        println!("  face {face:>4} depth {:>4} class {class:?}", depths[*face as usize]);
    }
    if !priorities {
        let far_to_near = order
            .windows(2)
            .all(|w| depths[w[0] as usize] >= depths[w[1] as usize]);
        println!("Far to near: {}", if far_to_near { "OK" } else { "MISMATCH" });
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => {
            println!("zonestream-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("jobs: {}", zonestream_jobs::crate_info());
            println!("render: {}", zonestream_render::crate_info());
            println!("sort: {}", zonestream_sort::crate_info());
            println!("model: {}", zonestream_model::crate_info());
            println!("scene: {}", zonestream_scene::crate_info());
            println!("stream: {}", zonestream_stream::crate_info());
            println!("config: {config:#?}");
        }
        Commands::Stream {
            steps,
            per_zone,
            frames,
        } => run_stream(config, steps, per_zone, frames)?,
        Commands::Sort { faces, priorities } => run_sort(faces, priorities),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonestream_model::Renderable;

    #[test]
    fn config_sections_are_optional() {
        let config: CliConfig =
            serde_json::from_str(r#"{ "stream": { "grid_zones": 5 } }"#).unwrap();
        assert_eq!(config.stream.grid_zones, 5);
        assert!(config.stream.zone_streaming);
        assert_eq!(config.jobs.thread_name, "zonestream-worker");
    }

    #[test]
    fn synthetic_windows_agree_where_they_overlap() {
        let a = synthetic_scene(0, 3, 2).unwrap();
        let b = synthetic_scene(8, 3, 2).unwrap();
        // World zone 1 is local zone 1 in `a` and local zone 0 in `b`.
        let ids = |scene: &Scene, zone: i32| -> Vec<u64> {
            scene
                .models()
                .iter()
                .filter(|m| m.zone().x == zone && m.zone().z == 0)
                .map(|m| m.renderable.id())
                .collect()
        };
        assert_eq!(ids(&a, 1), ids(&b, 0));
        assert_eq!(a.models().len(), 18);
    }

    #[test]
    fn short_stream_run_completes() {
        let config = CliConfig {
            jobs: JobSystemConfig {
                worker_count: 2,
                ..JobSystemConfig::default()
            },
            stream: StreamConfig {
                grid_zones: 5,
                ..StreamConfig::default()
            },
        };
        run_stream(config, 2, 2, 5).unwrap();
    }
}
