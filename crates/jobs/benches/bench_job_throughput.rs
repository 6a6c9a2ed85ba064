use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use zonestream_jobs::{Job, JobSystem, JobSystemConfig, Pool, complete_round_robin};

fn bench_queue_and_drain(workers: usize, job_count: usize) {
    let system = JobSystem::new(JobSystemConfig {
        worker_count: workers,
        ..JobSystemConfig::default()
    })
    .expect("spawn workers");
    let sum = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    let mut jobs: Vec<_> = (0..job_count)
        .map(|i| {
            let sum = sum.clone();
            let job = Job::from_fn("bench", move |_| {
                sum.fetch_add(black_box(i as u64), Ordering::Relaxed);
                Ok(())
            });
            job.queue(&system).expect("queue");
            job
        })
        .collect();
    let stolen = complete_round_robin(&mut jobs);
    let elapsed = start.elapsed();
    let per_job = elapsed / job_count as u32;
    println!(
        "  queue+drain ({workers} workers, {job_count} jobs): {per_job:?}/job, total {elapsed:?}, stolen {stolen}"
    );
}

fn bench_pool_cycle(iterations: usize) {
    let pool = Pool::bounded(64, || vec![0u8; 4096]);

    let start = Instant::now();
    for _ in 0..iterations {
        let item = black_box(pool.acquire()).expect("pool item");
        pool.recycle(item);
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!("  acquire+recycle ({iterations} iters): {per_iter:?}/iter, total {elapsed:?}");
}

fn main() {
    println!("=== Job Throughput Benchmarks ===\n");

    println!("Queue and drain:");
    bench_queue_and_drain(0, 10_000);
    bench_queue_and_drain(2, 10_000);
    bench_queue_and_drain(4, 10_000);

    println!("\nPool:");
    bench_pool_cycle(100_000);

    println!("\n=== Done ===");
}
