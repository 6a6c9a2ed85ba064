use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;
use parking_lot::Mutex;
use zonestream_common::LEVELS;
use zonestream_jobs::{FnJob, Job, JobError, JobSystem, Priority};
use zonestream_model::{PendingUploads, QueueOutcome, Renderable, SnapshotCache, UploadContext};
use zonestream_render::{GpuSink, RenderView};
use zonestream_scene::{OverrideResolver, Scene, ScenePrep};
use zonestream_sort::FacePrioritySorter;

use crate::bake::{BakeEnv, ZoneBake};
use crate::config::StreamConfig;
use crate::timing::{Stage, StageTimings};
use crate::world_view::{ViewId, WorldView, queue_bake};
use crate::zone::{PendingBake, Zone};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("scene is {actual} zones wide but the grid holds {expected}")]
    GridMismatch { expected: usize, actual: usize },
    #[error("a scene load is already pending")]
    LoadInProgress,
    #[error("no scene load is pending")]
    NoPendingLoad,
    #[error("no world view {0:?}")]
    UnknownView(ViewId),
    #[error("zone ({x}, {z}) is outside the grid")]
    ZoneOutOfBounds { x: i32, z: i32 },
    #[error(transparent)]
    Job(#[from] JobError),
}

/// How a scene load classified the cells of the new grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Old zones carried over without a rebake.
    pub reused: usize,
    /// Cells whose bake was pushed out of the immediate load.
    pub deferred: usize,
    /// Bakes queued into the scene load.
    pub queued: usize,
    /// Bakes waiting out a stagger delay.
    pub staggered: usize,
    /// Whether deferred cells are staggered rather than baked up front.
    pub stagger: bool,
}

/// Occupant of a cell in the grid being prepared.
enum NextCell {
    /// Old zone at this index moves over.
    Reuse(usize),
    Fresh(Zone),
}

/// A cell whose bake is ordered by distance from the grid centre.
struct Deferred {
    x: i32,
    z: i32,
    distance: f32,
    /// Old zone that keeps drawing until the bake lands.
    old: Option<usize>,
}

/// Work prepared by a reload and applied by the next swap.
struct PendingLoad {
    env: BakeEnv,
    cells: Vec<NextCell>,
    roof_diff: Option<FnJob>,
    roof_map: Arc<Mutex<BTreeMap<i32, i32>>>,
    stats: LoadStats,
}

/// Owns the root world view and any sub-scene views, and moves them from
/// one scene to the next.
///
/// A load is split in two: [`ZoneStreamer::reload_scene`] classifies every
/// cell and queues bakes while the old grid keeps drawing, and
/// [`ZoneStreamer::swap_scene`] installs the new grid on the frame thread.
pub struct ZoneStreamer {
    root: WorldView,
    subs: BTreeMap<u32, WorldView>,
    next: Option<PendingLoad>,
    config: StreamConfig,
    system: Arc<JobSystem>,
    sink: Arc<dyn GpuSink>,
    overrides: Arc<dyn OverrideResolver>,
    snapshots: SnapshotCache,
    timings: Arc<StageTimings>,
    draw_sorter: FacePrioritySorter,
}

impl ZoneStreamer {
    pub fn new(
        config: StreamConfig,
        system: Arc<JobSystem>,
        sink: Arc<dyn GpuSink>,
        overrides: Arc<dyn OverrideResolver>,
    ) -> Self {
        let timings = Arc::new(StageTimings::new());
        let root = WorldView::new(
            ViewId::Root,
            config.grid_zones,
            sink.clone(),
            overrides.clone(),
            timings.clone(),
        );
        tracing::debug!(grid = config.grid_zones, workers = system.worker_count(), "zone streamer created");
        Self {
            root,
            subs: BTreeMap::new(),
            next: None,
            snapshots: SnapshotCache::with_budget(config.snapshot_budget_bytes()),
            config,
            system,
            sink,
            overrides,
            timings,
            draw_sorter: FacePrioritySorter::new(),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn system(&self) -> &Arc<JobSystem> {
        &self.system
    }

    pub fn timings(&self) -> &Arc<StageTimings> {
        &self.timings
    }

    pub fn snapshots(&self) -> &SnapshotCache {
        &self.snapshots
    }

    pub fn is_load_pending(&self) -> bool {
        self.next.is_some()
    }

    pub fn root(&self) -> &WorldView {
        &self.root
    }

    pub fn view(&self, id: ViewId) -> Option<&WorldView> {
        match id {
            ViewId::Root => Some(&self.root),
            ViewId::Sub(sub) => self.subs.get(&sub),
        }
    }

    fn view_mut(&mut self, id: ViewId) -> Result<&mut WorldView, StreamError> {
        match id {
            ViewId::Root => Ok(&mut self.root),
            ViewId::Sub(sub) => self.subs.get_mut(&sub).ok_or(StreamError::UnknownView(id)),
        }
    }

    pub fn zone(&self, view: ViewId, x: i32, z: i32) -> Option<&Zone> {
        self.view(view).and_then(|v| v.zone(x, z))
    }

    /// Prepare the root grid for `scene` while the current grid keeps
    /// drawing.
    ///
    /// Old zones baked from the same content revision are carried over.
    /// Those with water, pending rebuilds or new ground within the edge
    /// margin are rebaked, and with zone streaming on, far cells are
    /// staggered by distance from the grid centre. Nothing is visible until
    /// [`ZoneStreamer::swap_scene`].
    pub fn reload_scene(&mut self, scene: Scene) -> Result<LoadStats, StreamError> {
        let _span = tracing::info_span!("reload_scene").entered();
        let size = self.config.grid_zones;
        if scene.size_zones() != size {
            return Err(StreamError::GridMismatch {
                expected: size,
                actual: scene.size_zones(),
            });
        }
        if self.next.is_some() {
            return Err(StreamError::LoadInProgress);
        }

        let mut cells = Vec::new();
        let prepared = self.prepare_load(scene, &mut cells);
        if let Err(err) = &prepared {
            tracing::warn!(error = %err, "scene load failed, keeping the current grid");
            self.restore_root(cells.into_iter().flatten());
        }
        prepared
    }

    /// Mark the old grid for culling and queue the bakes of the next one.
    /// Cells are filled in as they are prepared so a failure can undo them.
    fn prepare_load(
        &mut self,
        scene: Scene,
        cells: &mut Vec<Option<NextCell>>,
    ) -> Result<LoadStats, StreamError> {
        let start = Instant::now();
        let size = self.config.grid_zones;
        let system = self.system.clone();
        let config = &self.config;
        let sink = self.sink.as_ref();
        let root = &mut self.root;

        root.streaming.complete();
        root.invalidation.complete();
        root.blocking_invalidation.complete();
        for index in 0..root.zones.len() {
            root.handle_zone_swap(&system, -1.0, index);
        }
        for zone in &mut root.zones {
            zone.cull = true;
            drop_bake(zone, sink);
        }
        root.loading = true;

        let scene = Arc::new(scene);
        let prep = ScenePrep::job(scene.clone());
        prep.queue_with(&system, Priority::High, &[])?;
        let env = root.bake_env(scene.clone(), prep);
        let previous = root.scene().cloned();

        let roof_map = Arc::new(Mutex::new(BTreeMap::new()));
        let roof_diff = match &previous {
            Some(previous) => {
                let job = roof_diff_job(previous.clone(), scene.clone(), roof_map.clone());
                job.queue(&system)?;
                Some(job)
            }
            None => None,
        };

        let (dx, dz) = previous.as_ref().map_or((0, 0), |previous| {
            let (to, from) = (scene.base_zone(), previous.base_zone());
            (to.x - from.x, to.z - from.z)
        });
        let reusable = previous
            .as_ref()
            .is_some_and(|previous| previous.is_compatible_with(&scene));

        let n = size as i32;
        let old_ready: Vec<bool> = root.zones.iter().map(|z| z.initialized).collect();
        let old_index = |x: i32, z: i32| {
            ((0..n).contains(&x) && (0..n).contains(&z)).then(|| (x * n + z) as usize)
        };
        let maps_to_ready = |x: i32, z: i32| old_index(x + dx, z + dz).is_some_and(|i| old_ready[i]);
        let margin = config.edge_margin;
        let touches_new_ground = |x: i32, z: i32| {
            (-margin..=margin).any(|i| {
                (-margin..=margin).any(|j| {
                    let (nx, nz) = (x + i, z + j);
                    (0..n).contains(&nx) && (0..n).contains(&nz) && !maps_to_ready(nx, nz)
                })
            })
        };
        let centre = (size / 2) as f32;
        let distance =
            |x: i32, z: i32| ((x as f32 - centre).powi(2) + (z as f32 - centre).powi(2)).sqrt();

        let mut stats = LoadStats::default();
        cells.extend((0..size * size).map(|_| None));
        let mut deferred: Vec<Deferred> = Vec::new();

        if reusable {
            for x in 0..n {
                for z in 0..n {
                    let Some(old) = old_index(x + dx, z + dz) else {
                        continue;
                    };
                    if !old_ready[old] {
                        continue;
                    }
                    let revision = scene.revision(scene.world_zone(x, z));
                    let edge = touches_new_ground(x, z);
                    let zone = &mut root.zones[old];
                    if zone.revision != revision {
                        tracing::trace!(x, z, "zone content changed");
                        continue;
                    }
                    zone.needs_roof_update = true;
                    if zone.has_water || zone.dirty || zone.rebuild || edge {
                        tracing::trace!(x, z, water = zone.has_water, dirty = zone.dirty, edge, "zone deferred");
                        deferred.push(Deferred {
                            x,
                            z,
                            distance: distance(x, z),
                            old: Some(old),
                        });
                        stats.deferred += 1;
                    } else {
                        zone.cull = false;
                        stats.reused += 1;
                    }
                    cells[(x * n + z) as usize] = Some(NextCell::Reuse(old));
                }
            }
        }

        stats.stagger = config.zone_streaming
            && previous.is_some()
            && stats.reused + stats.deferred > 0;

        for x in 0..n {
            for z in 0..n {
                let cell = (x * n + z) as usize;
                if cells[cell].is_some() {
                    continue;
                }
                let d = distance(x, z);
                if !stats.stagger || d < config.defer_distance_start {
                    let job = ZoneBake::job(&env, x, z, false);
                    queue_bake(&root.scene_load, &system, &env, &job)?;
                    cells[cell] = Some(NextCell::Fresh(placeholder(job, None)));
                    stats.queued += 1;
                } else {
                    deferred.push(Deferred {
                        x,
                        z,
                        distance: d,
                        old: None,
                    });
                    stats.deferred += 1;
                }
            }
        }

        deferred.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        for cell in deferred {
            let index = (cell.x * n + cell.z) as usize;
            let dirty = cell.old.is_some_and(|old| root.zones[old].dirty);
            let job = ZoneBake::job(&env, cell.x, cell.z, dirty);
            if stats.stagger {
                let delay = Some(config.stagger_delay(cell.distance));
                match cell.old {
                    Some(old) => {
                        let zone = &mut root.zones[old];
                        zone.cull = false;
                        zone.bake = Some(PendingBake { job, delay });
                    }
                    None => cells[index] = Some(NextCell::Fresh(placeholder(job, delay))),
                }
                stats.staggered += 1;
            } else {
                queue_bake(&root.scene_load, &system, &env, &job)?;
                cells[index] = Some(NextCell::Fresh(placeholder(job, None)));
                stats.queued += 1;
            }
        }

        let cells = std::mem::take(cells)
            .into_iter()
            .map(|cell| cell.unwrap_or_else(|| NextCell::Fresh(Zone::new())))
            .collect();
        self.next = Some(PendingLoad {
            env,
            cells,
            roof_diff,
            roof_map,
            stats,
        });
        self.timings.record(Stage::SceneLoad, start.elapsed());
        tracing::info!(
            reused = stats.reused,
            deferred = stats.deferred,
            queued = stats.queued,
            staggered = stats.staggered,
            stagger = stats.stagger,
            "scene load prepared"
        );
        Ok(stats)
    }

    /// Install the grid prepared by the last reload.
    ///
    /// Waits for the scene-load bakes, remaps roof ids of carried-over
    /// zones and hands every old zone left behind to the pending-cull list.
    pub fn swap_scene(&mut self) -> Result<LoadStats, StreamError> {
        let _span = tracing::info_span!("swap_scene").entered();
        let start = Instant::now();
        let next = self.next.take().ok_or(StreamError::NoPendingLoad)?;
        let system = self.system.clone();
        let root = &mut self.root;

        let remap = match &next.roof_diff {
            Some(job) => {
                job.wait_for_completion();
                std::mem::take(&mut *next.roof_map.lock())
            }
            None => BTreeMap::new(),
        };

        let mut old: Vec<Option<Zone>> = std::mem::take(&mut root.zones)
            .into_iter()
            .map(Some)
            .collect();
        let mut zones: Vec<Zone> = next
            .cells
            .into_iter()
            .map(|cell| match cell {
                NextCell::Reuse(index) => old
                    .get_mut(index)
                    .and_then(Option::take)
                    .unwrap_or_default(),
                NextCell::Fresh(zone) => zone,
            })
            .collect();
        for zone in &mut zones {
            if zone.needs_roof_update {
                zone.needs_roof_update = false;
                if !remap.is_empty() {
                    zone.update_roofs(&remap);
                }
            }
        }

        root.env = Some(next.env);
        root.scene_load.complete();

        let mut culled = 0usize;
        {
            let mut pending = root.pending_cull.lock();
            for zone in old.into_iter().flatten() {
                debug_assert!(zone.cull, "live zone left out of the new grid");
                pending.push(zone);
                culled += 1;
            }
        }
        debug_assert!(zones.iter().all(|z| !z.cull), "cull zone in the new grid");
        root.zones = zones;
        root.loading = false;
        for index in 0..root.zones.len() {
            root.handle_zone_swap(&system, -1.0, index);
        }

        self.timings.record(Stage::Swap, start.elapsed());
        tracing::info!(culled, remapped_roofs = remap.len(), "scene swapped");
        Ok(next.stats)
    }

    /// Per-frame tick of every view: frees culled zones, advances stagger
    /// delays, installs finished bakes and starts requested rebuilds.
    pub fn update(&mut self, dt: f32) {
        let _span = tracing::info_span!("update").entered();
        let system = self.system.clone();
        self.root.update(&system, dt);
        for view in self.subs.values_mut() {
            view.update(&system, dt);
        }
    }

    /// Request a rebuild of one zone.
    pub fn invalidate_zone(&mut self, view: ViewId, x: i32, z: i32) -> Result<(), StreamError> {
        let system = self.system.clone();
        if self.view_mut(view)?.invalidate_zone(&system, x, z) {
            Ok(())
        } else {
            Err(StreamError::ZoneOutOfBounds { x, z })
        }
    }

    /// Wait for every queued bake of a view and install the results.
    /// Returns how many bakes ran on this thread.
    pub fn ensure_zones_complete(&mut self, view: ViewId) -> Result<usize, StreamError> {
        let system = self.system.clone();
        Ok(self.view_mut(view)?.ensure_zones_complete(&system))
    }

    /// Wait for snapshot uploads, either those of one zone or all of them.
    /// Returns how many uploads ran on this thread.
    pub fn ensure_async_uploads_complete(
        &self,
        zone: Option<(ViewId, i32, i32)>,
    ) -> Result<usize, StreamError> {
        let pending = match zone {
            Some((view, x, z)) => Some(self.pending_uploads(view, x, z)?),
            None => None,
        };
        Ok(self.timings.time(Stage::UploadComplete, || {
            self.snapshots.ensure_complete(pending.as_deref())
        }))
    }

    /// Snapshot a dynamic renderable and upload it off-thread. The upload is
    /// tracked by the zone at `(x, z)` so freeing the zone waits for it.
    pub fn queue_renderable(
        &self,
        view: ViewId,
        renderable: &dyn Renderable,
        (x, z): (i32, i32),
        upload: impl FnOnce(&mut UploadContext, &dyn Renderable) + Send + 'static,
    ) -> Result<QueueOutcome, StreamError> {
        let pending = self.pending_uploads(view, x, z)?;
        let outcome = self.timings.time(Stage::DynamicUpload, || {
            self.snapshots
                .queue(&self.system, renderable, Some(&pending), upload)
        })?;
        Ok(outcome)
    }

    fn pending_uploads(
        &self,
        view: ViewId,
        x: i32,
        z: i32,
    ) -> Result<Arc<PendingUploads>, StreamError> {
        let view = self.view(view).ok_or(StreamError::UnknownView(view))?;
        let zone = view
            .zone(x, z)
            .ok_or(StreamError::ZoneOutOfBounds { x, z })?;
        Ok(zone.pending().clone())
    }

    /// Start baking a sub scene into its own view. Any view loaded under
    /// the same id is destroyed first.
    pub fn load_sub_scene(&mut self, id: u32, scene: Scene) -> Result<(), StreamError> {
        let _span = tracing::info_span!("load_sub_scene", id).entered();
        if let Some(mut previous) = self.subs.remove(&id) {
            tracing::debug!(id, "replacing loaded sub scene");
            previous.destroy();
        }
        let size = scene.size_zones();
        let mut view = WorldView::new(
            ViewId::Sub(id),
            size,
            self.sink.clone(),
            self.overrides.clone(),
            self.timings.clone(),
        );
        let scene = Arc::new(scene);
        let prep = ScenePrep::job(scene.clone());
        prep.queue_with(&self.system, Priority::High, &[])?;
        let env = view.bake_env(scene, prep);
        for index in 0..size * size {
            let (x, z) = view.coord(index);
            let job = ZoneBake::job(&env, x, z, false);
            queue_bake(&view.scene_load, &self.system, &env, &job)?;
            view.zones[index].bake = Some(PendingBake { job, delay: None });
        }
        view.env = Some(env);
        self.subs.insert(id, view);
        Ok(())
    }

    /// Finish a sub scene load and make its zones drawable.
    pub fn swap_sub_scene(&mut self, id: u32) -> Result<(), StreamError> {
        let system = self.system.clone();
        let view = self
            .subs
            .get_mut(&id)
            .ok_or(StreamError::UnknownView(ViewId::Sub(id)))?;
        view.scene_load.complete();
        for index in 0..view.zones.len() {
            view.handle_zone_swap(&system, -1.0, index);
        }
        view.loading = false;
        tracing::debug!(id, "sub scene swapped");
        Ok(())
    }

    /// Cancel every bake of a sub scene and free its zones.
    pub fn despawn_world_view(&mut self, id: u32) -> Result<(), StreamError> {
        let mut view = self
            .subs
            .remove(&id)
            .ok_or(StreamError::UnknownView(ViewId::Sub(id)))?;
        view.destroy();
        tracing::debug!(id, "world view despawned");
        Ok(())
    }

    /// Draw multi-zone alpha models from the zone closest to `eye`.
    /// Returns the number of temporary copies made.
    pub fn reassign_multizone_alpha(&mut self, view: ViewId, eye: Vec3) -> Result<usize, StreamError> {
        Ok(self.view_mut(view)?.reassign_multizone_alpha(eye))
    }

    /// End-of-frame cleanup of temporary alpha copies and sort state.
    pub fn post_alpha_pass(&mut self, view: ViewId) -> Result<(), StreamError> {
        self.view_mut(view)?.post_alpha_pass();
        Ok(())
    }

    /// Queue this frame's sort of static alpha models.
    pub fn sort_static_alpha(
        &mut self,
        view: ViewId,
        render_view: &RenderView,
    ) -> Result<usize, StreamError> {
        let system = self.system.clone();
        Ok(self
            .view_mut(view)?
            .sort_static_alpha(&system, render_view)?)
    }

    /// Make sure one alpha model is sorted before it is drawn.
    pub fn force_sort(
        &mut self,
        view: ViewId,
        x: i32,
        z: i32,
        model: usize,
    ) -> Result<bool, StreamError> {
        let target = match view {
            ViewId::Root => &self.root,
            ViewId::Sub(id) => self.subs.get(&id).ok_or(StreamError::UnknownView(view))?,
        };
        Ok(target.force_sort(x, z, model, &mut self.draw_sorter))
    }

    /// Abandon a prepared load: cancel its bakes and free what it built.
    pub fn discard_pending_load(&mut self) -> Result<(), StreamError> {
        let next = self.next.take().ok_or(StreamError::NoPendingLoad)?;
        if let Some(job) = &next.roof_diff {
            job.cancel();
        }
        self.restore_root(next.cells);
        tracing::debug!("pending scene load discarded");
        Ok(())
    }

    /// Free the cells of an abandoned load and put the old grid, which was
    /// left in place, back in service.
    fn restore_root(&mut self, cells: impl IntoIterator<Item = NextCell>) {
        let sink = self.sink.as_ref();
        let root = &mut self.root;
        root.scene_load.cancel();
        for cell in cells {
            if let NextCell::Fresh(mut zone) = cell {
                drop_bake(&mut zone, sink);
                zone.free(sink);
            }
        }
        for zone in &mut root.zones {
            drop_bake(zone, sink);
            zone.cull = false;
            zone.needs_roof_update = false;
        }
        root.loading = false;
    }
}

impl Drop for ZoneStreamer {
    fn drop(&mut self) {
        if self.next.is_some() {
            let _ = self.discard_pending_load();
        }
    }
}

/// Cancel a zone's bake and free whatever it already built.
fn drop_bake(zone: &mut Zone, sink: &dyn GpuSink) {
    if let Some(bake) = zone.bake.take() {
        bake.discard(sink);
    }
}

fn placeholder(job: Job<ZoneBake>, delay: Option<f32>) -> Zone {
    let mut zone = Zone::new();
    zone.bake = Some(PendingBake { job, delay });
    zone
}

/// Job mapping roof ids of `previous` to those of `next` on the tiles both
/// scenes cover. The first mapping found for an old id wins.
fn roof_diff_job(
    previous: Arc<Scene>,
    next: Arc<Scene>,
    out: Arc<Mutex<BTreeMap<i32, i32>>>,
) -> FnJob {
    Job::from_fn("roof_diff", move |ctx| {
        let (px, pz) = previous.base();
        let (nx, nz) = next.base();
        let (dx, dz) = (nx - px, nz - pz);
        let tiles = next.size_tiles();
        let mut changes = BTreeMap::new();
        for level in 0..LEVELS as u8 {
            for x in 0..tiles {
                ctx.checkpoint()?;
                for z in 0..tiles {
                    let (ox, oz) = (x + dx, z + dz);
                    if !previous.contains_tile(ox, oz) {
                        continue;
                    }
                    let before = previous.roof(level, ox, oz);
                    let after = next.roof(level, x, z);
                    if before > 0 && after > 0 && before != after {
                        changes.entry(before).or_insert(after);
                    }
                }
            }
        }
        tracing::trace!(changes = changes.len(), "roof ids diffed");
        *out.lock() = changes;
        Ok(())
    })
}
