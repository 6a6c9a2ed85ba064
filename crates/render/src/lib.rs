//! Rendering adapter: the GPU buffer sink the streaming core writes into.
//!
//! # Invariants
//! - The core only appends to a sink; it never reads GPU memory back.
//! - Every reserved buffer is either finished and owned by a zone or frame,
//!   or released.
//!
//! [`RecordingSink`] keeps everything in memory so the core can run and be
//! tested without a GPU. A real backend implements [`GpuSink`] over mapped
//! write-combined buffers without changing callers.

mod recording;
mod sink;
mod staging;

pub use recording::{RecordedBuffer, RecordingSink};
pub use sink::{BufferId, BufferKind, DrawRange, DrawWriter, GpuSink, PackedVertex, RenderView, SinkError};
pub use staging::StagingBuffer;

pub fn crate_info() -> &'static str {
    "zonestream-render v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("render"));
    }
}
