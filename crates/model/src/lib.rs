//! Model: the read-only renderable interface, pooled asynchronous snapshots
//! of renderables and the face writer that packs them for the GPU sink.
//!
//! # Invariants
//! - A snapshot's fields become visible in copy order; each read waits only
//!   for the field it touches.
//! - Every snapshot field read belongs to the generation in its metadata.
//! - A snapshot job's upload runs at most once per queue.
//! - Pool exhaustion is never fatal: the upload runs inline on the renderable.

mod data;
mod renderable;
mod snapshot;
mod writer;

pub use data::ModelData;
pub use renderable::{ArrayRef, Renderable, with_model_faces};
pub use snapshot::{
    MAX_SNAPSHOT_BYTES, PendingUploads, QueueOutcome, Snapshot, SnapshotCache, SnapshotField,
    SnapshotMeta, SnapshotWork, UploadFn,
};
pub use writer::{
    DynamicDraw, FaceCounts, FacePass, FaceWriter, Placement, UploadContext, upload_dynamic,
};

pub fn crate_info() -> &'static str {
    "zonestream-model v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("model"));
    }
}
