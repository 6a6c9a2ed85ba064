use std::hint::black_box;
use std::time::Instant;

use glam::IVec3;
use zonestream_common::CameraAngles;
use zonestream_sort::{AlphaModel, AlphaPlacement, FacePrioritySorter, pack_face};

/// Cheap deterministic scatter so runs are comparable.
fn scatter(i: u32, modulo: u32) -> u32 {
    i.wrapping_mul(2_654_435_761) % modulo
}

fn bench_sort_faces(face_count: u32, with_priorities: bool, iterations: u32) {
    let visible: Vec<u32> = (0..face_count).collect();
    let depths: Vec<i32> = (0..face_count).map(|i| scatter(i, 2000) as i32).collect();
    let priorities: Vec<u8> = (0..face_count).map(|i| scatter(i, 12) as u8).collect();
    let priorities = with_priorities.then_some(priorities.as_slice());
    let mut sorter = FacePrioritySorter::new();

    let start = Instant::now();
    for _ in 0..iterations {
        black_box(sorter.sort_faces(black_box(&visible), &depths, priorities).len());
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations;
    println!(
        "  sort_faces ({face_count} faces, priorities={with_priorities}): {per_iter:?}/iter, total {elapsed:?}"
    );
}

fn bench_static_alpha(face_count: u32, iterations: u32) {
    let packed = (0..face_count)
        .map(|i| {
            pack_face(
                scatter(i, 400) as i32 - 200,
                scatter(i + 7, 100) as i32 - 50,
                scatter(i + 13, 400) as i32 - 200,
            )
        })
        .collect();
    let model = AlphaModel::from_packed(AlphaPlacement::at(IVec3::ZERO), packed, None);
    let mut sorter = FacePrioritySorter::new();

    let start = Instant::now();
    for i in 0..iterations {
        let angles = CameraAngles::new(i as i32 * 17, 256);
        black_box(sorter.sort_static_faces_by_distance(&model, angles));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations;
    println!("  static alpha ({face_count} faces): {per_iter:?}/iter, total {elapsed:?}");
}

fn main() {
    println!("=== Face Sort Benchmarks ===\n");

    println!("Depth buckets:");
    bench_sort_faces(500, false, 2_000);
    bench_sort_faces(4_000, false, 500);

    println!("\nPriority classes:");
    bench_sort_faces(500, true, 2_000);
    bench_sort_faces(4_000, true, 500);

    println!("\nStatic alpha models:");
    bench_static_alpha(1_000, 1_000);
    bench_static_alpha(10_000, 200);

    println!("\n=== Done ===");
}
