use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::job::{Dependency, Job, JobError, Work};
use crate::system::{JobSystem, Priority};

/// Timed wait per job once a round-robin pass made no progress.
const BLOCK_SLICE: Duration = Duration::from_millis(10);

/// Jobs queued together and completed or cancelled together.
pub struct JobGroup<W: Work> {
    name: &'static str,
    priority: Priority,
    auto_release: bool,
    pending: Mutex<Vec<Job<W>>>,
}

impl<W: Work> JobGroup<W> {
    pub fn new(name: &'static str, priority: Priority, auto_release: bool) -> Self {
        Self {
            name,
            priority,
            auto_release,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn queue(
        &self,
        system: &JobSystem,
        job: Job<W>,
        dependencies: &[Arc<dyn Dependency>],
    ) -> Result<(), JobError> {
        job.queue_with(system, self.priority, dependencies)?;
        self.pending.lock().push(job);
        Ok(())
    }

    /// Jobs in this group that have not finished yet.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().iter().filter(|j| !j.is_done()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Remove every tracked job from the group without waiting on it.
    pub fn take_pending(&self) -> Vec<Job<W>> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Wait for every job, stealing the ones that can start.
    pub fn complete(&self) {
        let jobs = self.take_pending();
        if jobs.is_empty() {
            return;
        }
        let count = jobs.len();
        let mut remaining = jobs.clone();
        let stolen = complete_round_robin(&mut remaining);
        tracing::trace!(group = self.name, count, stolen, "job group complete");
        if self.auto_release {
            for job in &jobs {
                job.release();
            }
        }
    }

    pub fn cancel(&self) {
        for job in self.take_pending() {
            job.cancel();
            if self.auto_release {
                job.release();
            }
        }
    }
}

/// Drain `jobs` until every one is done. Returns how many were stolen.
///
/// Each pass steals any job whose start condition holds. Only once a full
/// pass stole nothing does it fall back to short timed waits, one job at a time.
pub fn complete_round_robin<W: Work>(jobs: &mut Vec<Job<W>>) -> usize {
    let mut stolen = 0;
    let mut idx = 0;
    let mut should_block = false;
    let mut has_stolen = false;

    while !jobs.is_empty() {
        let job = &jobs[idx];
        let finished = if job.is_done() {
            true
        } else if job.try_steal() {
            has_stolen = true;
            stolen += 1;
            true
        } else if should_block {
            job.wait_for_completion_timeout(BLOCK_SLICE)
        } else {
            false
        };

        if finished {
            jobs.remove(idx);
        } else {
            idx += 1;
        }

        if idx >= jobs.len() {
            idx = 0;
            if !should_block {
                should_block = !has_stolen;
            }
            has_stolen = false;
        }
    }
    stolen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobContext;
    use crate::system::JobSystemConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Counted {
        runs: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
        gate: Arc<AtomicBool>,
    }

    impl Work for Counted {
        fn can_start(&self) -> bool {
            self.gate.load(Ordering::SeqCst)
        }

        fn run(&self, _ctx: &JobContext<'_>) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_released(&self, _job: &Job<Self>) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted(gate: &Arc<AtomicBool>, runs: &Arc<AtomicUsize>, releases: &Arc<AtomicUsize>) -> Job<Counted> {
        Job::new(Counted {
            runs: runs.clone(),
            releases: releases.clone(),
            gate: gate.clone(),
        })
    }

    #[test]
    fn complete_steals_inline_work() {
        let system = JobSystem::inline();
        let gate = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let group = JobGroup::new("test", Priority::High, true);
        for _ in 0..8 {
            group
                .queue(&system, counted(&gate, &runs, &releases), &[])
                .unwrap();
        }
        assert_eq!(group.pending_count(), 8);

        gate.store(true, Ordering::SeqCst);
        group.complete();
        assert_eq!(runs.load(Ordering::SeqCst), 8);
        assert_eq!(releases.load(Ordering::SeqCst), 8);
        assert!(group.is_empty());
    }

    #[test]
    fn cancel_skips_unstarted_work() {
        let system = JobSystem::inline();
        let gate = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let group = JobGroup::new("test", Priority::Normal, false);
        let job = counted(&gate, &runs, &releases);
        group.queue(&system, job.clone(), &[]).unwrap();
        group.cancel();
        assert!(job.was_cancelled());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn round_robin_converges_under_contention() {
        let system = JobSystem::new(JobSystemConfig {
            worker_count: 2,
            ..JobSystemConfig::default()
        })
        .unwrap();
        let gate = Arc::new(AtomicBool::new(true));
        let runs = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let mut jobs: Vec<_> = (0..200)
            .map(|_| {
                let job = counted(&gate, &runs, &releases);
                job.queue(&system).unwrap();
                job
            })
            .collect();
        complete_round_robin(&mut jobs);
        assert!(jobs.is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn round_robin_waits_for_late_starters() {
        let system = JobSystem::inline();
        let gate = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let mut jobs: Vec<_> = (0..3)
            .map(|_| {
                let job = counted(&gate, &runs, &releases);
                job.queue(&system).unwrap();
                job
            })
            .collect();

        let g = gate.clone();
        let opener = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            g.store(true, Ordering::SeqCst);
        });
        complete_round_robin(&mut jobs);
        opener.join().unwrap();
        assert!(jobs.is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
