use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;
use zonestream_common::ZONE_UNITS;
use zonestream_jobs::{JobSystem, JobSystemConfig};
use zonestream_model::ModelData;
use zonestream_render::RecordingSink;
use zonestream_scene::{NoOverrides, PlacedModel, Scene};
use zonestream_stream::{StreamConfig, ViewId, ZoneStreamer};

/// A few models per zone, keyed by world zone so shifted windows agree.
fn scene(base_x: i32, size: usize, per_zone: u32) -> Scene {
    let mut scene = Scene::new(base_x, 0, size).expect("aligned base");
    for x in 0..size as i32 {
        for z in 0..size as i32 {
            let world = scene.world_zone(x, z);
            for i in 0..per_zone {
                let id = ((world.x as u64) << 24) | ((world.z as u64) << 8) | i as u64;
                let offset = 64.0 + (i as f32 * 197.0) % (ZONE_UNITS as f32 - 128.0);
                let position = Scene::zone_origin(x, z) + Vec3::new(offset, 0.0, offset);
                let transparency = if i % 4 == 0 { 96 } else { 0 };
                let model = ModelData::cuboid(id, 40.0, 90.0, 0x3a5f, transparency);
                scene
                    .add_model(PlacedModel::new(Arc::new(model), position, 0))
                    .expect("model inside scene");
            }
        }
    }
    scene
}

fn streamer(workers: usize, grid: usize) -> ZoneStreamer {
    let system = JobSystem::new(JobSystemConfig {
        worker_count: workers,
        ..JobSystemConfig::default()
    })
    .expect("job system");
    let config = StreamConfig {
        grid_zones: grid,
        ..StreamConfig::default()
    };
    ZoneStreamer::new(
        config,
        Arc::new(system),
        Arc::new(RecordingSink::new()),
        Arc::new(NoOverrides),
    )
}

fn bench_full_load(workers: usize, grid: usize, per_zone: u32, iterations: u32) {
    let start = Instant::now();
    for _ in 0..iterations {
        let mut streamer = streamer(workers, grid);
        let stats = streamer.reload_scene(scene(0, grid, per_zone)).expect("reload");
        black_box(streamer.swap_scene().expect("swap"));
        black_box(stats.queued);
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations;
    println!(
        "  full load ({grid}x{grid}, {per_zone}/zone, {workers} workers): {per_iter:?}/iter, total {elapsed:?}"
    );
}

fn bench_shift(workers: usize, grid: usize, per_zone: u32, steps: i32) {
    let mut streamer = streamer(workers, grid);
    streamer.reload_scene(scene(0, grid, per_zone)).expect("reload");
    streamer.swap_scene().expect("swap");

    let mut reused = 0;
    let start = Instant::now();
    for step in 1..=steps {
        let stats = streamer
            .reload_scene(scene(step * 8, grid, per_zone))
            .expect("reload");
        streamer.swap_scene().expect("swap");
        reused += stats.reused;
        for _ in 0..8 {
            streamer.update(0.25);
        }
        black_box(streamer.ensure_zones_complete(ViewId::Root).expect("root view"));
    }
    let elapsed = start.elapsed();
    let per_step = elapsed / steps as u32;
    println!(
        "  shift by one zone ({grid}x{grid}, {workers} workers): {per_step:?}/step, reused {reused}, total {elapsed:?}"
    );
    println!("{}", streamer.timings().summary());
}

fn main() {
    println!("=== Zone Streaming Benchmarks ===\n");

    println!("Full loads:");
    bench_full_load(0, 9, 4, 20);
    bench_full_load(4, 9, 4, 20);
    bench_full_load(4, 23, 4, 3);

    println!("\nWindow shifts:");
    bench_shift(4, 13, 4, 10);
    bench_shift(4, 23, 2, 5);

    println!("\n=== Done ===");
}
