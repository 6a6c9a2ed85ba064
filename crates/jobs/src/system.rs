use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::job::{JobError, RunOutcome, Schedulable};

/// How long an idle worker sleeps before rechecking the queue.
const IDLE_WAIT: Duration = Duration::from_millis(5);
/// Backoff when a worker only has stalled work left.
const STALL_BACKOFF: Duration = Duration::from_micros(50);

/// Queue position of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    /// Pushed to the front of the queue.
    High,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSystemConfig {
    /// Number of worker threads. Zero runs every job on the thread that
    /// queues or waits for it.
    pub worker_count: usize,
    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        let worker_count = thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1);
        Self {
            worker_count,
            thread_name: "zonestream-worker".to_string(),
        }
    }
}

struct Shared {
    queue: Mutex<VecDeque<Arc<dyn Schedulable>>>,
    available: Condvar,
    active: AtomicBool,
}

/// A fixed pool of worker threads draining a shared job queue.
///
/// Threads that wait on a job steal it if it is still queued, so the render
/// thread never idles behind a busy pool.
pub struct JobSystem {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl JobSystem {
    pub fn new(config: JobSystemConfig) -> Result<Self, JobError> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            active: AtomicBool::new(true),
        });

        let mut workers = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name))
                .spawn(move || worker_loop(shared, index))
                .map_err(JobError::Spawn)?;
            workers.push(handle);
        }
        tracing::debug!(workers = config.worker_count, "job system started");

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            worker_count: config.worker_count,
        })
    }

    /// A system without worker threads. Jobs run where they are queued or waited on.
    pub fn inline() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                active: AtomicBool::new(true),
            }),
            workers: Mutex::new(Vec::new()),
            worker_count: 0,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Jobs waiting in the shared queue, excluding stalled work held by workers.
    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub(crate) fn submit(&self, job: Arc<dyn Schedulable>, priority: Priority) {
        if self.worker_count == 0 {
            let _ = job.try_run();
            return;
        }
        {
            let mut queue = self.shared.queue.lock();
            match priority {
                Priority::High => queue.push_front(job),
                Priority::Normal => queue.push_back(job),
            }
        }
        self.shared.available.notify_one();
    }

    /// Stop the workers, cancel queued work and join every thread.
    pub fn shutdown(&self) {
        if !self.shared.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.available.notify_all();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked during shutdown");
            }
        }

        let remaining: Vec<_> = self.shared.queue.lock().drain(..).collect();
        let cancelled = remaining.len();
        for job in remaining {
            job.abandon();
        }
        tracing::debug!(cancelled, "job system shut down");
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    let _span = tracing::debug_span!("job_worker", index).entered();
    let mut stalled: VecDeque<Arc<dyn Schedulable>> = VecDeque::new();

    while shared.active.load(Ordering::Acquire) {
        let fresh = {
            let mut queue = shared.queue.lock();
            match queue.pop_front() {
                Some(job) => Some(job),
                None if !stalled.is_empty() => None,
                None => {
                    shared.available.wait_for(&mut queue, IDLE_WAIT);
                    continue;
                }
            }
        };

        let (job, from_stall) = match fresh {
            Some(job) => (job, false),
            None => match stalled.pop_front() {
                Some(job) => (job, true),
                None => continue,
            },
        };

        if let RunOutcome::Stalled = Arc::clone(&job).try_run() {
            stalled.push_back(job);
            if from_stall {
                thread::sleep(STALL_BACKOFF);
            }
        }
    }

    for job in stalled {
        job.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    #[test]
    fn default_config_has_a_worker() {
        let config = JobSystemConfig::default();
        assert!(config.worker_count >= 1);
        assert_eq!(config.thread_name, "zonestream-worker");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: JobSystemConfig =
            serde_json::from_str(r#"{ "worker_count": 3 }"#).unwrap();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.thread_name, "zonestream-worker");
    }

    #[test]
    fn inline_system_runs_on_queue() {
        let system = JobSystem::inline();
        let job = Job::from_fn("inline", |_| Ok(()));
        job.queue(&system).unwrap();
        assert!(job.ran_to_completion());
        assert_eq!(system.queued_len(), 0);
    }

    #[test]
    fn high_priority_jumps_the_queue() {
        let system = JobSystem::new(JobSystemConfig {
            worker_count: 1,
            ..JobSystemConfig::default()
        })
        .unwrap();

        let release = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let (r, s) = (release.clone(), started.clone());
        let blocker = Job::from_fn("blocker", move |_| {
            s.store(true, Ordering::SeqCst);
            while !r.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_micros(100));
            }
            Ok(())
        });
        blocker.queue(&system).unwrap();
        while !started.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let normal = Job::from_fn("normal", move |_| {
            o1.lock().push("normal");
            Ok(())
        });
        let urgent = Job::from_fn("urgent", move |_| {
            o2.lock().push("urgent");
            Ok(())
        });
        normal.queue(&system).unwrap();
        urgent.queue_with(&system, Priority::High, &[]).unwrap();
        assert!(urgent.is_high_priority());
        assert_eq!(system.queued_len(), 2);

        release.store(true, Ordering::SeqCst);
        // Let the worker drain the queue instead of stealing from this thread.
        while !(normal.is_done() && urgent.is_done()) {
            thread::sleep(Duration::from_micros(100));
        }
        assert_eq!(*order.lock(), vec!["urgent", "normal"]);
    }

    #[test]
    fn shutdown_cancels_queued_jobs() {
        let system = JobSystem::new(JobSystemConfig {
            worker_count: 1,
            ..JobSystemConfig::default()
        })
        .unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let r = release.clone();
        let blocker = Job::from_fn("blocker", move |_| {
            while !r.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_micros(100));
            }
            Ok(())
        });
        blocker.queue(&system).unwrap();
        let pending: Vec<_> = (0..4)
            .map(|i| {
                let job = Job::from_fn(format!("pending-{i}"), |_| Ok(()));
                job.queue(&system).unwrap();
                job
            })
            .collect();

        let r = release.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            r.store(true, Ordering::SeqCst);
        });
        system.shutdown();
        releaser.join().unwrap();

        assert!(!system.is_active());
        for job in &pending {
            assert!(job.is_done());
        }
    }
}
