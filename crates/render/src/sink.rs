use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use zonestream_common::CameraAngles;

use crate::staging::StagingBuffer;

/// Vertices staged before a write is pushed to the sink.
const STAGING_INITIAL: usize = 96;
/// Hard cap on staged vertices; past this the writer flushes instead of growing.
const STAGING_LIMIT: usize = 3 * 4096;

/// Camera state used by draw-time sorting and zone selection.
#[derive(Debug, Clone, Copy)]
pub struct RenderView {
    /// Camera position in local scene units.
    pub eye: Vec3,
    /// Camera orientation in fixed-point angle units.
    pub angles: CameraAngles,
}

impl Default for RenderView {
    fn default() -> Self {
        Self {
            eye: Vec3::ZERO,
            angles: CameraAngles::new(0, 256),
        }
    }
}

/// Handle to a buffer reserved in a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// What a buffer holds and how long it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Opaque geometry owned by a zone until the zone is freed.
    ZoneOpaque,
    /// Transparent geometry owned by a zone until the zone is freed.
    ZoneAlpha,
    /// Opaque geometry of a dynamic object, valid for one frame.
    FrameOpaque,
    /// Sorted transparent geometry of a dynamic object, valid for one frame.
    FrameAlpha,
}

impl BufferKind {
    pub fn is_frame_local(self) -> bool {
        matches!(self, BufferKind::FrameOpaque | BufferKind::FrameAlpha)
    }
}

/// One vertex as laid out in GPU memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct PackedVertex {
    pub position: [f32; 3],
    /// `alpha << 24 | hsl`.
    pub color: u32,
    /// Normal xyz and a padding lane.
    pub normal: [i16; 4],
    /// Texture id + 1, zero when untextured.
    pub material: u32,
}

/// A finished draw: a buffer and the vertices written into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawRange {
    pub buffer: BufferId,
    pub kind: BufferKind,
    pub vertex_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),
    #[error("buffer {0:?} is already finished")]
    AlreadyFinished(BufferId),
}

/// Destination for packed geometry.
pub trait GpuSink: Send + Sync {
    /// Reserve a buffer large enough for `face_count` faces.
    fn reserve(&self, kind: BufferKind, face_count: usize) -> Result<BufferId, SinkError>;

    /// Append vertices to a reserved buffer.
    fn write(&self, id: BufferId, vertices: &[PackedVertex]) -> Result<(), SinkError>;

    /// Seal a buffer for drawing.
    fn finish(&self, id: BufferId) -> Result<DrawRange, SinkError>;

    /// Free a buffer. Unknown ids are ignored.
    fn release(&self, id: BufferId);
}

/// Writes faces into one reserved sink buffer through a staging buffer.
///
/// Faces past the reservation are dropped and counted. A writer dropped
/// without [`DrawWriter::end`] releases its buffer.
pub struct DrawWriter<'a> {
    sink: &'a dyn GpuSink,
    id: BufferId,
    kind: BufferKind,
    reserved_faces: usize,
    faces: usize,
    dropped_faces: usize,
    staging: StagingBuffer<PackedVertex>,
    partial: [PackedVertex; 3],
    partial_len: usize,
    finished: bool,
}

impl<'a> DrawWriter<'a> {
    pub fn begin_draw(
        sink: &'a dyn GpuSink,
        kind: BufferKind,
        face_count: usize,
    ) -> Result<Self, SinkError> {
        let id = sink.reserve(kind, face_count)?;
        Ok(Self {
            sink,
            id,
            kind,
            reserved_faces: face_count,
            faces: 0,
            dropped_faces: 0,
            staging: StagingBuffer::new(STAGING_INITIAL, STAGING_LIMIT),
            partial: [PackedVertex::default(); 3],
            partial_len: 0,
            finished: false,
        })
    }

    pub fn buffer(&self) -> BufferId {
        self.id
    }

    pub fn face_count(&self) -> usize {
        self.faces
    }

    /// Vertices written so far, staged or flushed.
    pub fn vertex_count(&self) -> u32 {
        (self.faces * 3) as u32
    }

    pub fn dropped_faces(&self) -> usize {
        self.dropped_faces
    }

    /// Append one vertex; every third vertex completes a face.
    pub fn put_vertex(&mut self, vertex: PackedVertex) -> Result<(), SinkError> {
        self.partial[self.partial_len] = vertex;
        self.partial_len += 1;
        if self.partial_len == 3 {
            self.partial_len = 0;
            self.put_face(self.partial)?;
        }
        Ok(())
    }

    pub fn put_face(&mut self, vertices: [PackedVertex; 3]) -> Result<(), SinkError> {
        if self.faces >= self.reserved_faces {
            if self.dropped_faces == 0 {
                tracing::debug!(
                    buffer = self.id.0,
                    reserved = self.reserved_faces,
                    "draw reservation exhausted, dropping faces"
                );
            }
            self.dropped_faces += 1;
            return Ok(());
        }
        for vertex in vertices {
            if self.staging.is_full() {
                self.flush()?;
            }
            self.staging.push(vertex);
        }
        self.faces += 1;
        Ok(())
    }

    pub fn put_faces(&mut self, faces: &[[PackedVertex; 3]]) -> Result<(), SinkError> {
        for face in faces {
            self.put_face(*face)?;
        }
        Ok(())
    }

    /// Flush staged vertices and seal the buffer.
    pub fn end(mut self) -> Result<DrawRange, SinkError> {
        debug_assert_eq!(self.partial_len, 0, "draw ended on an incomplete face");
        self.flush()?;
        self.finished = true;
        let range = self.sink.finish(self.id)?;
        debug_assert_eq!(range.kind, self.kind);
        Ok(range)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let sink = self.sink;
        let id = self.id;
        self.staging.drain_with(|vertices| sink.write(id, vertices))
    }
}

impl Drop for DrawWriter<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.sink.release(self.id);
        }
    }
}
