use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::system::{JobSystem, Priority};

/// Sleep between polls while waiting on another thread's job.
const WAIT_POLL: Duration = Duration::from_micros(50);
/// Interval between "still waiting" warnings.
const DEADLOCK_WARNING: Duration = Duration::from_secs(1);

/// Lifecycle state of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Idle = 0,
    Queued = 1,
    Running = 2,
    Cancelled = 3,
    Completed = 4,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobState::Idle,
            1 => JobState::Queued,
            2 => JobState::Running,
            3 => JobState::Cancelled,
            _ => JobState::Completed,
        }
    }
}

/// Errors surfaced by the job layer.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job was cancelled")]
    Cancelled,
    #[error("job cannot be queued while {0:?}")]
    AlreadyQueued(JobState),
    #[error("job system is shut down")]
    ShutDown,
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("job failed: {0}")]
    Failed(String),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Payload and lifecycle hooks of a job.
///
/// Hooks take `&self`; work that mutates state between cycles keeps it behind
/// its own locks or atomics.
pub trait Work: Send + Sync + Sized + 'static {
    /// Release the job as soon as it completes, running [`Work::on_released`].
    const AUTO_RELEASE: bool = false;

    fn label(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether the job may start now. Jobs that cannot start are retried later.
    fn can_start(&self) -> bool {
        true
    }

    fn run(&self, ctx: &JobContext<'_>) -> Result<(), JobError>;

    fn on_cancel(&self) {}

    fn on_completion(&self) {}

    fn on_released(&self, _job: &Job<Self>) {}
}

/// Something a job can wait on before it starts.
pub trait Dependency: Send + Sync {
    fn is_done(&self) -> bool;
    fn was_cancelled(&self) -> bool;
}

/// Handle passed to [`Work::run`] for cooperative cancellation.
pub struct JobContext<'a> {
    state: &'a AtomicU8,
}

impl JobContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        JobState::from_u8(self.state.load(Ordering::Acquire)) == JobState::Cancelled
    }

    /// Cancellation checkpoint. Long-running work calls this between steps.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub(crate) enum RunOutcome {
    Ran,
    Stalled,
    Skipped,
}

/// Type-erased view of a job used by the worker queue.
pub(crate) trait Schedulable: Send + Sync {
    fn try_run(self: Arc<Self>) -> RunOutcome;
    fn abandon(self: Arc<Self>);
}

enum DependencyStatus {
    Ready,
    Waiting,
    Failed,
}

pub(crate) struct JobInner<W: Work> {
    state: AtomicU8,
    high_priority: AtomicBool,
    done: AtomicBool,
    released: AtomicBool,
    ran_to_completion: AtomicBool,
    encountered_error: AtomicBool,
    was_cancelled: AtomicBool,
    runner: Mutex<Option<ThreadId>>,
    dependencies: Mutex<Vec<Arc<dyn Dependency>>>,
    work: W,
}

impl<W: Work> JobInner<W> {
    fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: JobState, to: JobState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn dependency_status(&self) -> DependencyStatus {
        let deps = self.dependencies.lock();
        if deps.iter().any(|d| d.is_done() && d.was_cancelled()) {
            DependencyStatus::Failed
        } else if deps.iter().all(|d| d.is_done()) {
            DependencyStatus::Ready
        } else {
            DependencyStatus::Waiting
        }
    }
}

impl<W: Work> Dependency for JobInner<W> {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.state() == JobState::Idle
    }

    fn was_cancelled(&self) -> bool {
        self.was_cancelled.load(Ordering::Acquire)
    }
}

impl<W: Work> Schedulable for JobInner<W> {
    fn try_run(self: Arc<Self>) -> RunOutcome {
        Job { inner: self }.try_run()
    }

    fn abandon(self: Arc<Self>) {
        Job { inner: self }.cancel_queued();
    }
}

/// A reusable, cancellable unit of work.
///
/// Cloning a `Job` clones the handle, not the work.
pub struct Job<W: Work> {
    inner: Arc<JobInner<W>>,
}

impl<W: Work> Clone for Job<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Work> std::fmt::Debug for Job<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("label", &self.label())
            .field("state", &self.state())
            .finish()
    }
}

impl<W: Work> Job<W> {
    pub fn new(work: W) -> Self {
        Self {
            inner: Arc::new(JobInner {
                state: AtomicU8::new(JobState::Idle as u8),
                high_priority: AtomicBool::new(false),
                done: AtomicBool::new(false),
                released: AtomicBool::new(false),
                ran_to_completion: AtomicBool::new(false),
                encountered_error: AtomicBool::new(false),
                was_cancelled: AtomicBool::new(false),
                runner: Mutex::new(None),
                dependencies: Mutex::new(Vec::new()),
                work,
            }),
        }
    }

    pub fn work(&self) -> &W {
        &self.inner.work
    }

    pub fn label(&self) -> &str {
        self.inner.work.label()
    }

    pub fn state(&self) -> JobState {
        self.inner.state()
    }

    pub fn is_queued(&self) -> bool {
        self.state() == JobState::Queued
    }

    /// True when the job is not in flight: never queued, released, or finished
    /// with all of its hooks run.
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn ran_to_completion(&self) -> bool {
        self.inner.ran_to_completion.load(Ordering::Acquire)
    }

    pub fn was_cancelled(&self) -> bool {
        self.inner.was_cancelled()
    }

    pub fn encountered_error(&self) -> bool {
        self.inner.encountered_error.load(Ordering::Acquire)
    }

    pub fn is_high_priority(&self) -> bool {
        self.inner.high_priority.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &Job<W>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// This job as a dependency of other jobs.
    pub fn dependency(&self) -> Arc<dyn Dependency> {
        self.inner.clone()
    }

    pub fn queue(&self, system: &JobSystem) -> Result<(), JobError> {
        self.queue_with(system, Priority::Normal, &[])
    }

    /// Transition Idle → Queued and submit to `system`. The job does not start
    /// before every dependency is done.
    pub fn queue_with(
        &self,
        system: &JobSystem,
        priority: Priority,
        dependencies: &[Arc<dyn Dependency>],
    ) -> Result<(), JobError> {
        if !system.is_active() {
            return Err(JobError::ShutDown);
        }
        let state = self.state();
        if state != JobState::Idle {
            return Err(JobError::AlreadyQueued(state));
        }

        let inner = &self.inner;
        inner.done.store(false, Ordering::Release);
        inner.released.store(false, Ordering::Release);
        inner.ran_to_completion.store(false, Ordering::Release);
        inner.encountered_error.store(false, Ordering::Release);
        inner.was_cancelled.store(false, Ordering::Release);
        inner
            .high_priority
            .store(priority == Priority::High, Ordering::Release);
        *inner.dependencies.lock() = dependencies.to_vec();

        if !inner.transition(JobState::Idle, JobState::Queued) {
            return Err(JobError::AlreadyQueued(self.state()));
        }
        tracing::trace!(job = self.label(), ?priority, "job queued");
        system.submit(inner.clone(), priority);
        Ok(())
    }

    /// Run the job on the calling thread if it is Queued and able to start.
    pub fn try_steal(&self) -> bool {
        matches!(self.try_run(), RunOutcome::Ran)
    }

    /// Cancel the job. Safe from any state; repeated calls are no-ops.
    ///
    /// A running job is flagged and observed at its next checkpoint; the caller
    /// then waits for it to finish unless it is the running thread itself.
    pub fn cancel(&self) {
        loop {
            match self.state() {
                JobState::Idle => return,
                JobState::Queued => {
                    if self.cancel_queued() {
                        return;
                    }
                }
                JobState::Running => {
                    if self.inner.transition(JobState::Running, JobState::Cancelled) {
                        tracing::trace!(job = self.label(), "running job flagged for cancellation");
                        break;
                    }
                }
                JobState::Cancelled | JobState::Completed => break,
            }
        }
        if !self.is_running_on_current_thread() {
            self.wait_for_completion();
        }
    }

    /// Block until the job is done, running it here first if it is still Queued.
    pub fn wait_for_completion(&self) {
        self.wait(None);
    }

    /// Like [`Job::wait_for_completion`] but gives up after `timeout`.
    /// Returns whether the job is done.
    pub fn wait_for_completion_timeout(&self, timeout: Duration) -> bool {
        self.wait(Some(timeout))
    }

    /// Wait for completion, return the job to Idle and run its release hook.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wait_for_completion();
        self.inner
            .state
            .store(JobState::Idle as u8, Ordering::Release);
        self.inner.work.on_released(self);
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        let mut next_warning = DEADLOCK_WARNING;
        loop {
            if self.is_done() {
                return true;
            }
            if self.is_queued() && self.try_steal() {
                continue;
            }
            let elapsed = start.elapsed();
            if timeout.is_some_and(|limit| elapsed >= limit) {
                return false;
            }
            if elapsed >= next_warning {
                tracing::warn!(
                    job = self.label(),
                    state = ?self.state(),
                    waited_ms = elapsed.as_millis() as u64,
                    "still waiting on job, possible deadlock"
                );
                next_warning += DEADLOCK_WARNING;
            }
            thread::sleep(WAIT_POLL);
        }
    }

    fn is_running_on_current_thread(&self) -> bool {
        *self.inner.runner.lock() == Some(thread::current().id())
    }

    fn try_run(&self) -> RunOutcome {
        if self.state() != JobState::Queued {
            return RunOutcome::Skipped;
        }
        match self.inner.dependency_status() {
            DependencyStatus::Failed => {
                tracing::debug!(job = self.label(), "dependency cancelled, cancelling dependant");
                self.cancel_queued();
                return RunOutcome::Skipped;
            }
            DependencyStatus::Waiting => return RunOutcome::Stalled,
            DependencyStatus::Ready => {}
        }
        if !self.inner.work.can_start() {
            return RunOutcome::Stalled;
        }
        if !self.inner.transition(JobState::Queued, JobState::Running) {
            return RunOutcome::Skipped;
        }
        self.execute();
        RunOutcome::Ran
    }

    fn execute(&self) {
        let inner = &self.inner;
        *inner.runner.lock() = Some(thread::current().id());

        let ctx = JobContext {
            state: &inner.state,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            ctx.checkpoint()?;
            inner.work.run(&ctx)
        }))
        .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(payload.as_ref()))));

        match outcome {
            Ok(()) => {
                if inner.transition(JobState::Running, JobState::Completed) {
                    inner.ran_to_completion.store(true, Ordering::Release);
                }
            }
            Err(JobError::Cancelled) => {
                tracing::trace!(job = self.label(), "job observed cancellation");
            }
            Err(err) => {
                tracing::warn!(job = self.label(), error = %err, "job failed");
                inner.encountered_error.store(true, Ordering::Release);
                inner.transition(JobState::Running, JobState::Cancelled);
            }
        }

        *inner.runner.lock() = None;
        self.finish();
    }

    fn cancel_queued(&self) -> bool {
        if self.inner.transition(JobState::Queued, JobState::Cancelled) {
            tracing::trace!(job = self.label(), "queued job cancelled");
            self.finish();
            true
        } else {
            false
        }
    }

    fn finish(&self) {
        let inner = &self.inner;
        if inner.state() != JobState::Completed {
            inner
                .state
                .store(JobState::Cancelled as u8, Ordering::Release);
            inner.was_cancelled.store(true, Ordering::Release);
            inner.work.on_cancel();
        }
        inner
            .state
            .store(JobState::Completed as u8, Ordering::Release);
        inner.work.on_completion();
        inner.done.store(true, Ordering::Release);

        if W::AUTO_RELEASE {
            self.release();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

type JobFn = Box<dyn FnMut(&JobContext<'_>) -> Result<(), JobError> + Send>;

/// Closure-backed work for one-off jobs.
pub struct FnWork {
    label: String,
    body: Mutex<JobFn>,
}

impl FnWork {
    pub fn new(
        label: impl Into<String>,
        body: impl FnMut(&JobContext<'_>) -> Result<(), JobError> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            body: Mutex::new(Box::new(body)),
        }
    }
}

impl Work for FnWork {
    fn label(&self) -> &str {
        &self.label
    }

    fn run(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let mut body = self.body.lock();
        (*body)(ctx)
    }
}

pub type FnJob = Job<FnWork>;

impl Job<FnWork> {
    pub fn from_fn(
        label: impl Into<String>,
        body: impl FnMut(&JobContext<'_>) -> Result<(), JobError> + Send + 'static,
    ) -> Self {
        Job::new(FnWork::new(label, body))
    }
}
