use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use zonestream_common::Tint;
use zonestream_jobs::{
    Job, JobContext, JobError, JobSystem, Pool, Priority, Work, complete_round_robin,
};

use crate::renderable::{ArrayRef, Renderable};
use crate::writer::UploadContext;

/// Spins before a field wait falls back to sleeping.
const FIELD_SPINS: u32 = 64;
const FIELD_SLEEP: Duration = Duration::from_micros(5);

/// Worst-case bytes held by one snapshot, used to size the pool from a budget.
pub const MAX_SNAPSHOT_BYTES: u64 = {
    const MAX_VERTICES: u64 = 6500;
    const MAX_FACES: u64 = 6500;
    // xyz f32 + normals xyz i32, per vertex
    let per_vertex = 3 * 4 + 3 * 4;
    // indices + colours (u32/i32 ×6), transparency, priority, texture
    let per_face = 6 * 4 + 1 + 1 + 2;
    MAX_VERTICES * per_vertex + MAX_FACES * per_face
};

/// Snapshot arrays, listed in the order they are copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotField {
    VerticesX,
    VerticesY,
    VerticesZ,
    ColorsA,
    ColorsC,
    IndicesA,
    IndicesB,
    IndicesC,
    Transparencies,
    Textures,
    Priorities,
    NormalsX,
    NormalsY,
    NormalsZ,
    ColorsB,
}

impl SnapshotField {
    pub const COPY_ORDER: [SnapshotField; 15] = [
        SnapshotField::VerticesX,
        SnapshotField::VerticesY,
        SnapshotField::VerticesZ,
        SnapshotField::ColorsA,
        SnapshotField::ColorsC,
        SnapshotField::IndicesA,
        SnapshotField::IndicesB,
        SnapshotField::IndicesC,
        SnapshotField::Transparencies,
        SnapshotField::Textures,
        SnapshotField::Priorities,
        SnapshotField::NormalsX,
        SnapshotField::NormalsY,
        SnapshotField::NormalsZ,
        SnapshotField::ColorsB,
    ];
}

struct FieldData<T> {
    data: Vec<T>,
    present: bool,
    generation: u64,
}

/// One snapshot array. Written once per generation, then flagged cached;
/// readers wait on the flag, never on the writer.
struct CachedArray<T> {
    field: RwLock<FieldData<T>>,
    cached: AtomicBool,
}

impl<T: Copy> CachedArray<T> {
    fn new() -> Self {
        Self {
            field: RwLock::new(FieldData {
                data: Vec::new(),
                present: false,
                generation: 0,
            }),
            cached: AtomicBool::new(false),
        }
    }

    fn fill(&self, source: Option<&[T]>, generation: u64) {
        {
            let mut field = self.field.write();
            field.data.clear();
            if let Some(source) = source {
                field.data.extend_from_slice(source);
            }
            field.present = source.is_some();
            field.generation = generation;
        }
        self.cached.store(true, Ordering::Release);
    }

    fn is_cached(&self) -> bool {
        self.cached.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.cached.store(false, Ordering::Release);
    }

    fn wait(&self) {
        let mut spins = 0;
        while !self.is_cached() {
            if spins < FIELD_SPINS {
                std::hint::spin_loop();
                spins += 1;
            } else {
                thread::sleep(FIELD_SLEEP);
            }
        }
    }

    fn guard(&self, generation: u64) -> RwLockReadGuard<'_, FieldData<T>> {
        self.wait();
        let field = self.field.read();
        debug_assert_eq!(
            field.generation, generation,
            "snapshot field read for a different generation"
        );
        field
    }

    fn read(&self, generation: u64) -> ArrayRef<'_, T> {
        ArrayRef::Guarded(RwLockReadGuard::map(self.guard(generation), |f| {
            f.data.as_slice()
        }))
    }

    fn read_optional(&self, generation: u64) -> Option<ArrayRef<'_, T>> {
        let field = self.guard(generation);
        if !field.present {
            return None;
        }
        Some(ArrayRef::Guarded(RwLockReadGuard::map(field, |f| {
            f.data.as_slice()
        })))
    }

    fn capacity(&self) -> usize {
        self.field.read().data.capacity()
    }
}

/// Scalar metadata captured at queue time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SnapshotMeta {
    pub id: u64,
    pub radius: i32,
    pub model_height: i32,
    pub vertex_count: usize,
    pub face_count: usize,
    pub tint: Tint,
    pub generation: u64,
}

/// Deep copy of a renderable, filled field by field while a worker may
/// already be reading the fields that are done.
pub struct Snapshot {
    meta: Mutex<SnapshotMeta>,
    vertices_x: CachedArray<f32>,
    vertices_y: CachedArray<f32>,
    vertices_z: CachedArray<f32>,
    indices_a: CachedArray<u32>,
    indices_b: CachedArray<u32>,
    indices_c: CachedArray<u32>,
    colors_a: CachedArray<i32>,
    colors_b: CachedArray<i32>,
    colors_c: CachedArray<i32>,
    transparencies: CachedArray<u8>,
    textures: CachedArray<i16>,
    priorities: CachedArray<u8>,
    normals_x: CachedArray<i32>,
    normals_y: CachedArray<i32>,
    normals_z: CachedArray<i32>,
}

impl Snapshot {
    fn new() -> Self {
        Self {
            meta: Mutex::new(SnapshotMeta::default()),
            vertices_x: CachedArray::new(),
            vertices_y: CachedArray::new(),
            vertices_z: CachedArray::new(),
            indices_a: CachedArray::new(),
            indices_b: CachedArray::new(),
            indices_c: CachedArray::new(),
            colors_a: CachedArray::new(),
            colors_b: CachedArray::new(),
            colors_c: CachedArray::new(),
            transparencies: CachedArray::new(),
            textures: CachedArray::new(),
            priorities: CachedArray::new(),
            normals_x: CachedArray::new(),
            normals_y: CachedArray::new(),
            normals_z: CachedArray::new(),
        }
    }

    pub fn meta(&self) -> SnapshotMeta {
        *self.meta.lock()
    }

    fn generation(&self) -> u64 {
        self.meta.lock().generation
    }

    pub fn is_cached(&self, field: SnapshotField) -> bool {
        match field {
            SnapshotField::VerticesX => self.vertices_x.is_cached(),
            SnapshotField::VerticesY => self.vertices_y.is_cached(),
            SnapshotField::VerticesZ => self.vertices_z.is_cached(),
            SnapshotField::ColorsA => self.colors_a.is_cached(),
            SnapshotField::ColorsC => self.colors_c.is_cached(),
            SnapshotField::IndicesA => self.indices_a.is_cached(),
            SnapshotField::IndicesB => self.indices_b.is_cached(),
            SnapshotField::IndicesC => self.indices_c.is_cached(),
            SnapshotField::Transparencies => self.transparencies.is_cached(),
            SnapshotField::Textures => self.textures.is_cached(),
            SnapshotField::Priorities => self.priorities.is_cached(),
            SnapshotField::NormalsX => self.normals_x.is_cached(),
            SnapshotField::NormalsY => self.normals_y.is_cached(),
            SnapshotField::NormalsZ => self.normals_z.is_cached(),
            SnapshotField::ColorsB => self.colors_b.is_cached(),
        }
    }

    /// Vertex positions, face indices and the third colour: enough to start
    /// an upload.
    fn required_cached(&self) -> bool {
        self.vertices_x.is_cached()
            && self.vertices_y.is_cached()
            && self.vertices_z.is_cached()
            && self.indices_a.is_cached()
            && self.indices_b.is_cached()
            && self.indices_c.is_cached()
            && self.colors_c.is_cached()
    }

    /// Capacity of the vertex position buffer, kept across reuse.
    pub fn vertex_capacity(&self) -> usize {
        self.vertices_x.capacity()
    }

    fn capture_scalars(&self, source: &dyn Renderable, generation: u64) {
        *self.meta.lock() = SnapshotMeta {
            id: source.id(),
            radius: source.radius(),
            model_height: source.model_height(),
            vertex_count: source.vertex_count(),
            face_count: source.face_count(),
            tint: source.tint(),
            generation,
        };
    }

    fn copy_fields(&self, source: &dyn Renderable, generation: u64) {
        let g = generation;
        self.vertices_x.fill(Some(&source.vertices_x()[..]), g);
        self.vertices_y.fill(Some(&source.vertices_y()[..]), g);
        self.vertices_z.fill(Some(&source.vertices_z()[..]), g);

        self.colors_a.fill(Some(&source.face_colors_a()[..]), g);
        self.colors_c.fill(Some(&source.face_colors_c()[..]), g);

        self.indices_a.fill(Some(&source.face_indices_a()[..]), g);
        self.indices_b.fill(Some(&source.face_indices_b()[..]), g);
        self.indices_c.fill(Some(&source.face_indices_c()[..]), g);

        self.transparencies.fill(source.face_transparencies().as_deref(), g);
        self.textures.fill(source.face_textures().as_deref(), g);

        self.priorities.fill(source.face_priorities().as_deref(), g);

        self.normals_x.fill(source.vertex_normals_x().as_deref(), g);
        self.normals_y.fill(source.vertex_normals_y().as_deref(), g);
        self.normals_z.fill(source.vertex_normals_z().as_deref(), g);

        self.colors_b.fill(Some(&source.face_colors_b()[..]), g);
    }

    /// Block until the copier has cached every field of this generation.
    fn wait_all(&self) {
        self.vertices_x.wait();
        self.vertices_y.wait();
        self.vertices_z.wait();
        self.colors_a.wait();
        self.colors_c.wait();
        self.indices_a.wait();
        self.indices_b.wait();
        self.indices_c.wait();
        self.transparencies.wait();
        self.textures.wait();
        self.priorities.wait();
        self.normals_x.wait();
        self.normals_y.wait();
        self.normals_z.wait();
        self.colors_b.wait();
    }

    fn reset_cached(&self) {
        for field in SnapshotField::COPY_ORDER {
            match field {
                SnapshotField::VerticesX => self.vertices_x.reset(),
                SnapshotField::VerticesY => self.vertices_y.reset(),
                SnapshotField::VerticesZ => self.vertices_z.reset(),
                SnapshotField::ColorsA => self.colors_a.reset(),
                SnapshotField::ColorsC => self.colors_c.reset(),
                SnapshotField::IndicesA => self.indices_a.reset(),
                SnapshotField::IndicesB => self.indices_b.reset(),
                SnapshotField::IndicesC => self.indices_c.reset(),
                SnapshotField::Transparencies => self.transparencies.reset(),
                SnapshotField::Textures => self.textures.reset(),
                SnapshotField::Priorities => self.priorities.reset(),
                SnapshotField::NormalsX => self.normals_x.reset(),
                SnapshotField::NormalsY => self.normals_y.reset(),
                SnapshotField::NormalsZ => self.normals_z.reset(),
                SnapshotField::ColorsB => self.colors_b.reset(),
            }
        }
    }
}

impl Renderable for Snapshot {
    fn id(&self) -> u64 {
        self.meta.lock().id
    }

    fn vertex_count(&self) -> usize {
        self.meta.lock().vertex_count
    }

    fn face_count(&self) -> usize {
        self.meta.lock().face_count
    }

    fn radius(&self) -> i32 {
        self.meta.lock().radius
    }

    fn model_height(&self) -> i32 {
        self.meta.lock().model_height
    }

    fn tint(&self) -> Tint {
        self.meta.lock().tint
    }

    fn vertices_x(&self) -> ArrayRef<'_, f32> {
        self.vertices_x.read(self.generation())
    }

    fn vertices_y(&self) -> ArrayRef<'_, f32> {
        self.vertices_y.read(self.generation())
    }

    fn vertices_z(&self) -> ArrayRef<'_, f32> {
        self.vertices_z.read(self.generation())
    }

    fn face_indices_a(&self) -> ArrayRef<'_, u32> {
        self.indices_a.read(self.generation())
    }

    fn face_indices_b(&self) -> ArrayRef<'_, u32> {
        self.indices_b.read(self.generation())
    }

    fn face_indices_c(&self) -> ArrayRef<'_, u32> {
        self.indices_c.read(self.generation())
    }

    fn face_colors_a(&self) -> ArrayRef<'_, i32> {
        self.colors_a.read(self.generation())
    }

    fn face_colors_b(&self) -> ArrayRef<'_, i32> {
        self.colors_b.read(self.generation())
    }

    fn face_colors_c(&self) -> ArrayRef<'_, i32> {
        self.colors_c.read(self.generation())
    }

    fn face_transparencies(&self) -> Option<ArrayRef<'_, u8>> {
        self.transparencies.read_optional(self.generation())
    }

    fn face_textures(&self) -> Option<ArrayRef<'_, i16>> {
        self.textures.read_optional(self.generation())
    }

    fn face_priorities(&self) -> Option<ArrayRef<'_, u8>> {
        self.priorities.read_optional(self.generation())
    }

    fn vertex_normals_x(&self) -> Option<ArrayRef<'_, i32>> {
        self.normals_x.read_optional(self.generation())
    }

    fn vertex_normals_y(&self) -> Option<ArrayRef<'_, i32>> {
        self.normals_y.read_optional(self.generation())
    }

    fn vertex_normals_z(&self) -> Option<ArrayRef<'_, i32>> {
        self.normals_z.read_optional(self.generation())
    }
}

/// Callback run with a finished snapshot, or with the source renderable
/// itself when no snapshot was available.
pub type UploadFn = Box<dyn FnOnce(&mut UploadContext, &dyn Renderable) + Send>;

/// Per-queue bookkeeping, dropped when the job is recycled.
struct InFlight {
    upload: Option<UploadFn>,
    target: Option<Arc<PendingUploads>>,
    cache: Arc<CacheShared>,
}

/// Pooled job that snapshots a renderable and runs an upload against it.
pub struct SnapshotWork {
    snapshot: Snapshot,
    processing: AtomicBool,
    in_flight: Mutex<Option<InFlight>>,
}

impl SnapshotWork {
    fn new() -> Self {
        Self {
            snapshot: Snapshot::new(),
            processing: AtomicBool::new(false),
            in_flight: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Run the upload unless another thread already claimed it.
    fn process(&self) -> bool {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let (upload, cache) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.as_mut() {
                Some(f) => (f.upload.take(), Arc::clone(&f.cache)),
                None => return false,
            }
        };
        if let Some(upload) = upload {
            let mut ctx = cache.contexts.checkout_blocking();
            upload(&mut ctx, &self.snapshot);
        }
        // The copier may still be filling fields the upload never read.
        self.snapshot.wait_all();
        true
    }
}

impl Work for SnapshotWork {
    const AUTO_RELEASE: bool = true;

    fn label(&self) -> &str {
        "snapshot_upload"
    }

    fn can_start(&self) -> bool {
        self.processing.load(Ordering::Acquire) || self.snapshot.required_cached()
    }

    fn run(&self, _ctx: &JobContext<'_>) -> Result<(), JobError> {
        self.process();
        Ok(())
    }

    fn on_completion(&self) {
        let detach = self
            .in_flight
            .lock()
            .as_ref()
            .map(|f| (f.target.clone(), Arc::clone(&f.cache)));
        if let Some((target, cache)) = detach {
            cache.in_flight.remove(self);
            if let Some(target) = target {
                target.remove(self);
            }
        }
        self.snapshot.reset_cached();
    }

    fn on_released(&self, job: &Job<Self>) {
        if let Some(in_flight) = self.in_flight.lock().take() {
            in_flight.cache.pool.recycle(job.clone());
        }
    }
}

/// Snapshot jobs still in flight for one zone, or for the whole cache.
#[derive(Default)]
pub struct PendingUploads {
    jobs: Mutex<Vec<Job<SnapshotWork>>>,
}

impl PendingUploads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    fn push(&self, job: Job<SnapshotWork>) {
        self.jobs.lock().push(job);
    }

    fn remove(&self, work: &SnapshotWork) {
        self.jobs.lock().retain(|j| !std::ptr::eq(j.work(), work));
    }

    /// Drain every listed job, stealing what can run here. Returns how many
    /// were stolen.
    pub fn complete(&self) -> usize {
        let mut stolen = 0;
        loop {
            let mut jobs = self.jobs.lock().clone();
            if jobs.is_empty() {
                return stolen;
            }
            stolen += complete_round_robin(&mut jobs);
        }
    }
}

struct CacheShared {
    pool: Pool<Job<SnapshotWork>>,
    contexts: Pool<UploadContext>,
    in_flight: PendingUploads,
    generation: AtomicU64,
}

/// How [`SnapshotCache::queue`] handled a renderable.
#[derive(Debug)]
pub enum QueueOutcome {
    /// Snapshotted and queued; the upload runs on a worker or on whoever
    /// completes the job.
    Queued(Job<SnapshotWork>),
    /// The pool was exhausted and the upload ran synchronously.
    Inline,
}

/// Pool of snapshot jobs sized from a memory budget.
pub struct SnapshotCache {
    shared: Arc<CacheShared>,
}

impl SnapshotCache {
    pub fn new(capacity: usize) -> Self {
        Self::from_pool(Pool::bounded(capacity, || Job::new(SnapshotWork::new())))
    }

    /// Capacity is `budget_bytes / MAX_SNAPSHOT_BYTES`, rounded up.
    pub fn with_budget(budget_bytes: u64) -> Self {
        Self::from_pool(Pool::with_budget(budget_bytes, MAX_SNAPSHOT_BYTES, || {
            Job::new(SnapshotWork::new())
        }))
    }

    fn from_pool(pool: Pool<Job<SnapshotWork>>) -> Self {
        tracing::debug!(capacity = ?pool.capacity(), "snapshot cache created");
        Self {
            shared: Arc::new(CacheShared {
                pool,
                contexts: Pool::unbounded(UploadContext::default),
                in_flight: PendingUploads::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.shared.pool.capacity()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.len()
    }

    /// Snapshot `source` and queue `upload` against the copy.
    ///
    /// The job is queued before its fields are copied; it becomes runnable as
    /// soon as positions, indices and the third colour are in place.
    pub fn queue(
        &self,
        system: &JobSystem,
        source: &dyn Renderable,
        target: Option<&Arc<PendingUploads>>,
        upload: impl FnOnce(&mut UploadContext, &dyn Renderable) + Send + 'static,
    ) -> Result<QueueOutcome, JobError> {
        let Some(job) = self.shared.pool.acquire() else {
            tracing::trace!(id = source.id(), "snapshot pool exhausted, uploading inline");
            let mut ctx = self.shared.contexts.checkout_blocking();
            upload(&mut ctx, source);
            return Ok(QueueOutcome::Inline);
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let work = job.work();
        work.processing.store(false, Ordering::Release);
        *work.in_flight.lock() = Some(InFlight {
            upload: Some(Box::new(upload)),
            target: target.cloned(),
            cache: Arc::clone(&self.shared),
        });

        if let Err(err) = job.queue_with(system, Priority::Normal, &[]) {
            work.in_flight.lock().take();
            self.shared.pool.recycle(job);
            return Err(err);
        }
        self.shared.in_flight.push(job.clone());
        if let Some(target) = target {
            target.push(job.clone());
        }

        work.snapshot.capture_scalars(source, generation);
        work.snapshot.copy_fields(source, generation);
        Ok(QueueOutcome::Queued(job))
    }

    /// Wait for the uploads of one zone, or for every in-flight upload.
    /// Returns with nothing pending in that scope.
    pub fn ensure_complete(&self, scope: Option<&PendingUploads>) -> usize {
        let pending = scope.unwrap_or(&self.shared.in_flight);
        let stolen = pending.complete();
        tracing::trace!(stolen, "snapshot uploads complete");
        stolen
    }
}
