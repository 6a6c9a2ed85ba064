//! Jobs: cancellable units of work, a fixed worker pool with work stealing,
//! job groups, and bounded object pools.
//!
//! # Invariants
//! - A job is stolen only while Queued; once Running only its claimant finishes it.
//! - Cancel, completion and release hooks run at most once per queue cycle, in that order.
//! - Pool items are either free or checked out by exactly one owner.
//!
//! There is no process-wide scheduler: every job is queued onto an explicit
//! [`JobSystem`], and every pool is an owned [`Pool`] value.

mod group;
mod job;
mod pool;
mod system;

pub use group::{JobGroup, complete_round_robin};
pub use job::{Dependency, FnJob, FnWork, Job, JobContext, JobError, JobState, Work};
pub use pool::{Pool, Pooled};
pub use system::{JobSystem, JobSystemConfig, Priority};

pub fn crate_info() -> &'static str {
    "zonestream-jobs v0.1.0"
}
