use std::collections::BTreeMap;
use std::fmt::Write as _;

use parking_lot::Mutex;

use crate::sink::{BufferId, BufferKind, DrawRange, GpuSink, PackedVertex, SinkError};

/// A buffer as seen by the recording sink.
#[derive(Debug, Clone)]
pub struct RecordedBuffer {
    pub kind: BufferKind,
    pub reserved_faces: usize,
    /// Raw vertex bytes, exactly as a GPU upload would see them.
    pub bytes: Vec<u8>,
    pub finished: bool,
}

impl RecordedBuffer {
    pub fn vertex_count(&self) -> usize {
        self.bytes.len() / std::mem::size_of::<PackedVertex>()
    }
}

#[derive(Default)]
struct RecordingState {
    next_id: u64,
    buffers: BTreeMap<BufferId, RecordedBuffer>,
    write_calls: usize,
}

/// In-memory sink standing in for a GPU backend.
///
/// Thread safe, so bake jobs on worker threads can write into it
/// concurrently with the frame thread.
#[derive(Default)]
pub struct RecordingSink {
    state: Mutex<RecordingState>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers reserved and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_buffers_of(&self, kind: BufferKind) -> usize {
        self.state
            .lock()
            .buffers
            .values()
            .filter(|b| b.kind == kind)
            .count()
    }

    pub fn vertex_count(&self, id: BufferId) -> Option<usize> {
        self.state.lock().buffers.get(&id).map(RecordedBuffer::vertex_count)
    }

    /// Decoded vertices of a buffer, or `None` if it was never reserved or
    /// has been released.
    pub fn vertices(&self, id: BufferId) -> Option<Vec<PackedVertex>> {
        self.state
            .lock()
            .buffers
            .get(&id)
            .map(|b| {
                b.bytes
                    .chunks_exact(std::mem::size_of::<PackedVertex>())
                    .map(bytemuck::pod_read_unaligned)
                    .collect()
            })
    }

    pub fn buffer(&self, id: BufferId) -> Option<RecordedBuffer> {
        self.state.lock().buffers.get(&id).cloned()
    }

    pub fn write_calls(&self) -> usize {
        self.state.lock().write_calls
    }

    /// Release every frame-local buffer. Returns how many were freed.
    pub fn end_frame(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.buffers.len();
        state.buffers.retain(|_, b| !b.kind.is_frame_local());
        let freed = before - state.buffers.len();
        tracing::trace!(freed, "frame buffers released");
        freed
    }

    /// Human-readable dump of every live buffer.
    pub fn summary(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "=== Recording sink (buffers={}, writes={}) ===",
            state.buffers.len(),
            state.write_calls
        );
        for (id, buffer) in &state.buffers {
            let _ = writeln!(
                out,
                "  [{:>4}] {:?} faces={}/{} {}",
                id.0,
                buffer.kind,
                buffer.vertex_count() / 3,
                buffer.reserved_faces,
                if buffer.finished { "finished" } else { "open" }
            );
        }
        out
    }
}

impl GpuSink for RecordingSink {
    fn reserve(&self, kind: BufferKind, face_count: usize) -> Result<BufferId, SinkError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = BufferId(state.next_id);
        let capacity = face_count * 3 * std::mem::size_of::<PackedVertex>();
        state.buffers.insert(
            id,
            RecordedBuffer {
                kind,
                reserved_faces: face_count,
                bytes: Vec::with_capacity(capacity.min(1 << 20)),
                finished: false,
            },
        );
        Ok(id)
    }

    fn write(&self, id: BufferId, vertices: &[PackedVertex]) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        state.write_calls += 1;
        let buffer = state
            .buffers
            .get_mut(&id)
            .ok_or(SinkError::UnknownBuffer(id))?;
        if buffer.finished {
            return Err(SinkError::AlreadyFinished(id));
        }
        buffer.bytes.extend_from_slice(bytemuck::cast_slice(vertices));
        Ok(())
    }

    fn finish(&self, id: BufferId) -> Result<DrawRange, SinkError> {
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get_mut(&id)
            .ok_or(SinkError::UnknownBuffer(id))?;
        if buffer.finished {
            return Err(SinkError::AlreadyFinished(id));
        }
        buffer.finished = true;
        Ok(DrawRange {
            buffer: id,
            kind: buffer.kind,
            vertex_count: buffer.vertex_count() as u32,
        })
    }

    fn release(&self, id: BufferId) {
        self.state.lock().buffers.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: f32) -> PackedVertex {
        PackedVertex {
            position: [x, 1.0, 2.0],
            color: 0xFF00_1234,
            normal: [0, 1, 0, 0],
            material: 0,
        }
    }

    #[test]
    fn writes_are_appended_as_bytes() {
        let sink = RecordingSink::new();
        let id = sink.reserve(BufferKind::ZoneOpaque, 1).unwrap();
        sink.write(id, &[vertex(0.0), vertex(1.0)]).unwrap();
        sink.write(id, &[vertex(2.0)]).unwrap();
        let range = sink.finish(id).unwrap();

        assert_eq!(range.vertex_count, 3);
        assert_eq!(sink.write_calls(), 2);
        let vertices = sink.vertices(id).unwrap();
        assert_eq!(vertices[2], vertex(2.0));
        assert_eq!(sink.buffer(id).unwrap().bytes.len(), 3 * 28);
    }

    #[test]
    fn finished_buffers_reject_writes() {
        let sink = RecordingSink::new();
        let id = sink.reserve(BufferKind::ZoneAlpha, 1).unwrap();
        sink.finish(id).unwrap();
        assert!(matches!(
            sink.write(id, &[vertex(0.0)]),
            Err(SinkError::AlreadyFinished(_))
        ));
        assert!(matches!(
            sink.finish(id),
            Err(SinkError::AlreadyFinished(_))
        ));
    }

    #[test]
    fn unknown_buffers_are_errors() {
        let sink = RecordingSink::new();
        assert!(matches!(
            sink.write(BufferId(99), &[]),
            Err(SinkError::UnknownBuffer(BufferId(99)))
        ));
        sink.release(BufferId(99));
    }

    #[test]
    fn end_frame_frees_only_frame_buffers() {
        let sink = RecordingSink::new();
        sink.reserve(BufferKind::ZoneOpaque, 1).unwrap();
        sink.reserve(BufferKind::FrameOpaque, 1).unwrap();
        sink.reserve(BufferKind::FrameAlpha, 1).unwrap();
        assert_eq!(sink.end_frame(), 2);
        assert_eq!(sink.live_buffers(), 1);
        assert_eq!(sink.live_buffers_of(BufferKind::ZoneOpaque), 1);
    }

    #[test]
    fn summary_lists_buffers() {
        let sink = RecordingSink::new();
        let id = sink.reserve(BufferKind::ZoneOpaque, 4).unwrap();
        sink.write(id, &[vertex(0.0), vertex(1.0), vertex(2.0)]).unwrap();
        let text = sink.summary();
        assert!(text.contains("buffers=1"));
        assert!(text.contains("faces=1/4"));
        assert!(text.contains("open"));
    }
}
