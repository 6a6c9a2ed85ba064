use std::sync::Arc;

use glam::Vec3;
use parking_lot::Mutex;
use zonestream_common::{CameraAngles, TILE_UNITS, ZONE_TILES};
use zonestream_jobs::{
    Job, JobContext, JobError, JobGroup, JobSystem, Priority, Work, complete_round_robin,
};
use zonestream_render::{GpuSink, RenderView};
use zonestream_scene::{OverrideResolver, Scene, ScenePrep};
use zonestream_sort::{AlphaModel, FacePrioritySorter};

use crate::bake::{BakeEnv, ZoneBake};
use crate::timing::{Stage, StageTimings};
use crate::zone::{PendingBake, Zone};

/// Which world view an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewId {
    Root,
    Sub(u32),
}

/// Queue a bake into `group` behind its scene preparation job.
pub(crate) fn queue_bake(
    group: &JobGroup<ZoneBake>,
    system: &JobSystem,
    env: &BakeEnv,
    job: &Job<ZoneBake>,
) -> Result<(), JobError> {
    group.queue(system, job.clone(), &[env.prep.dependency()])
}

/// A square grid of zones for one scene, with the job groups that feed it.
pub struct WorldView {
    pub(crate) id: ViewId,
    pub(crate) size: usize,
    pub(crate) zones: Vec<Zone>,
    pub(crate) env: Option<BakeEnv>,
    pub(crate) sink: Arc<dyn GpuSink>,
    pub(crate) overrides: Arc<dyn OverrideResolver>,
    pub(crate) pending_cull: Arc<Mutex<Vec<Zone>>>,
    /// Between a reload and its swap; updates are skipped.
    pub(crate) loading: bool,
    pub(crate) scene_load: JobGroup<ZoneBake>,
    pub(crate) streaming: JobGroup<ZoneBake>,
    pub(crate) invalidation: JobGroup<ZoneBake>,
    pub(crate) blocking_invalidation: JobGroup<ZoneBake>,
    alpha_sort: Job<StaticAlphaSort>,
}

impl WorldView {
    pub(crate) fn new(
        id: ViewId,
        size: usize,
        sink: Arc<dyn GpuSink>,
        overrides: Arc<dyn OverrideResolver>,
        timings: Arc<StageTimings>,
    ) -> Self {
        Self {
            id,
            size,
            zones: (0..size * size).map(|_| Zone::new()).collect(),
            env: None,
            sink,
            overrides,
            pending_cull: Arc::new(Mutex::new(Vec::new())),
            loading: true,
            scene_load: JobGroup::new("scene_load", Priority::High, false),
            streaming: JobGroup::new("streaming", Priority::Normal, false),
            invalidation: JobGroup::new("invalidation", Priority::Normal, false),
            blocking_invalidation: JobGroup::new("blocking_invalidation", Priority::High, false),
            alpha_sort: Job::new(StaticAlphaSort::new(timings)),
        }
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    /// Zones per side.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn scene(&self) -> Option<&Arc<Scene>> {
        self.env.as_ref().map(|env| &env.scene)
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn zone(&self, x: i32, z: i32) -> Option<&Zone> {
        self.index(x, z).map(|i| &self.zones[i])
    }

    /// Every cell with its grid coordinate.
    pub fn zones(&self) -> impl Iterator<Item = ((i32, i32), &Zone)> + '_ {
        self.zones
            .iter()
            .enumerate()
            .map(|(i, zone)| (self.coord(i), zone))
    }

    pub fn pending_cull_len(&self) -> usize {
        self.pending_cull.lock().len()
    }

    /// Bakes queued or waiting out a stagger delay.
    pub fn pending_bakes(&self) -> usize {
        self.zones.iter().filter(|z| z.bake.is_some()).count()
    }

    pub(crate) fn index(&self, x: i32, z: i32) -> Option<usize> {
        let size = self.size as i32;
        ((0..size).contains(&x) && (0..size).contains(&z)).then(|| (x * size + z) as usize)
    }

    pub(crate) fn coord(&self, index: usize) -> (i32, i32) {
        ((index / self.size) as i32, (index % self.size) as i32)
    }

    pub(crate) fn bake_env(&self, scene: Arc<Scene>, prep: Job<ScenePrep>) -> BakeEnv {
        BakeEnv {
            scene,
            prep,
            sink: self.sink.clone(),
            overrides: self.overrides.clone(),
            pending_cull: self.pending_cull.clone(),
        }
    }

    /// Release every zone waiting for a safe point. Returns how many.
    pub(crate) fn free_pending_cull(&mut self) -> usize {
        let culled = std::mem::take(&mut *self.pending_cull.lock());
        let count = culled.len();
        for mut zone in culled {
            zone.free(self.sink.as_ref());
        }
        if count > 0 {
            tracing::trace!(view = ?self.id, count, "culled zones freed");
        }
        count
    }

    /// Move a replaced zone out of the grid.
    fn retire(&mut self, mut zone: Zone) {
        zone.cull = true;
        self.pending_cull.lock().push(zone);
    }

    /// Advance the bake attached to one cell.
    ///
    /// A positive `dt` counts down a stagger delay and queues the bake once
    /// it runs out. A finished bake is installed in place of the current
    /// zone; a failed one is retried once if the current zone still has its
    /// retry.
    pub(crate) fn handle_zone_swap(&mut self, system: &JobSystem, dt: f32, index: usize) {
        let Some(delay) = self.zones[index].bake.as_ref().map(|b| b.delay) else {
            return;
        };
        let (x, z) = self.coord(index);

        if let Some(delay) = delay {
            if dt <= 0.0 {
                return;
            }
            let Some(bake) = self.zones[index].bake.as_mut() else {
                return;
            };
            if delay > dt {
                bake.delay = Some(delay - dt);
                return;
            }
            bake.delay = None;
            let job = bake.job.clone();
            let queued = match &self.env {
                Some(env) => queue_bake(&self.streaming, system, env, &job),
                None => Err(JobError::Cancelled),
            };
            if let Err(err) = queued {
                tracing::warn!(view = ?self.id, x, z, error = %err, "staggered bake not queued");
                self.zones[index].bake = None;
            }
            return;
        }

        let job = match &self.zones[index].bake {
            Some(bake) if bake.job.is_done() => bake.job.clone(),
            _ => return,
        };
        self.zones[index].bake = None;
        let work = job.work();

        if job.ran_to_completion() && !job.was_cancelled() {
            if let Some(fresh) = work.take_output() {
                debug_assert!(!fresh.cull, "cull zone installed");
                let old = std::mem::replace(&mut self.zones[index], fresh);
                self.retire(old);
            }
        } else if job.encountered_error() && !self.zones[index].cull {
            let current = &mut self.zones[index];
            if current.retry_failed_bake {
                current.retry_failed_bake = false;
                current.rebuild = true;
                tracing::debug!(view = ?self.id, x, z, "zone bake failed, retrying");
                if let Some(mut failed) = work.take_output() {
                    failed.free(self.sink.as_ref());
                }
            } else {
                tracing::warn!(view = ?self.id, x, z, "zone bake failed again, installing empty zone");
                let mut empty = work.take_output().unwrap_or_default();
                empty.initialized = true;
                empty.retry_failed_bake = false;
                let old = std::mem::replace(&mut self.zones[index], empty);
                self.retire(old);
            }
        }
        job.release();
    }

    /// Replace the bake of one cell, keeping any stagger delay it had.
    pub(crate) fn invalidate(&mut self, system: &JobSystem, index: usize, blocking: bool) {
        let Some(env) = self.env.clone() else {
            return;
        };
        let (x, z) = self.coord(index);
        let zone = &mut self.zones[index];
        let mut delay = None;
        if let Some(previous) = zone.bake.take() {
            delay = previous.delay;
            previous.discard(self.sink.as_ref());
        }
        let job = ZoneBake::job(&env, x, z, zone.dirty);
        zone.bake = Some(PendingBake {
            job: job.clone(),
            delay,
        });
        if delay.is_some() {
            return;
        }
        let group = if blocking {
            &self.blocking_invalidation
        } else {
            &self.invalidation
        };
        if let Err(err) = queue_bake(group, system, &env, &job) {
            tracing::warn!(view = ?self.id, x, z, error = %err, "invalidation bake not queued");
            self.zones[index].bake = None;
        }
    }

    /// Rebuild a zone. Zones with dynamic content are rebuilt before the end
    /// of this frame, others keep drawing until the rebuild is done.
    pub(crate) fn invalidate_zone(&mut self, system: &JobSystem, x: i32, z: i32) -> bool {
        let Some(index) = self.index(x, z) else {
            return false;
        };
        let zone = &mut self.zones[index];
        if zone.rebuild {
            return true;
        }
        if zone.contains_dynamic {
            tracing::debug!(view = ?self.id, x, z, "blocking zone invalidation");
            self.invalidate(system, index, true);
        } else {
            zone.rebuild = true;
        }
        true
    }

    pub(crate) fn update(&mut self, system: &JobSystem, dt: f32) {
        if self.loading {
            return;
        }
        self.free_pending_cull();
        for index in 0..self.zones.len() {
            self.handle_zone_swap(system, dt, index);
            if self.zones[index].rebuild {
                self.zones[index].rebuild = false;
                self.invalidate(system, index, false);
            }
        }
        self.complete_invalidation(system);
    }

    /// Finish blocking rebuilds and install whatever is ready.
    pub(crate) fn complete_invalidation(&mut self, system: &JobSystem) {
        self.blocking_invalidation.complete();
        for index in 0..self.zones.len() {
            self.handle_zone_swap(system, -1.0, index);
        }
    }

    /// Wait for every queued bake, then install them. Returns how many
    /// bakes the caller ran itself.
    pub(crate) fn ensure_zones_complete(&mut self, system: &JobSystem) -> usize {
        let mut jobs: Vec<Job<ZoneBake>> = self
            .zones
            .iter()
            .filter_map(|z| z.bake.as_ref())
            .filter(|b| b.delay.is_none() && !b.job.is_done())
            .map(|b| b.job.clone())
            .collect();
        let waiting = jobs.len();
        let stolen = complete_round_robin(&mut jobs);
        for index in 0..self.zones.len() {
            self.handle_zone_swap(system, -1.0, index);
        }
        tracing::trace!(view = ?self.id, waiting, stolen, "zones complete");
        stolen
    }

    /// Draw multi-zone alpha models from the zone closest to `eye` among the
    /// zones they cover. The closer zone gets a temporary copy and the
    /// source is skipped this frame. Returns the number of copies made.
    pub(crate) fn reassign_multizone_alpha(&mut self, eye: Vec3) -> usize {
        let ready: Vec<bool> = self.zones.iter().map(|z| z.initialized).collect();
        let mut copies: Vec<(usize, AlphaModel)> = Vec::new();
        let (ex, ez) = (eye.x as i64, eye.z as i64);

        for index in 0..self.zones.len() {
            let (zx, zz) = self.coord(index);
            let size = self.size as i32;
            for model in &mut self.zones[index].alpha_models {
                let Some(span) = model.span else {
                    continue;
                };
                if model.is_temp() {
                    continue;
                }
                let mut best = i64::MAX;
                let mut closest = None;
                for x in (span.lx >> 3)..=(span.ux >> 3) {
                    for z in (span.lz >> 3)..=(span.uz >> 3) {
                        let (tx, tz) = (zx + x as i32, zz + z as i32);
                        if !(0..size).contains(&tx) || !(0..size).contains(&tz) {
                            continue;
                        }
                        let target = (tx * size + tz) as usize;
                        if !ready[target] {
                            continue;
                        }
                        let half = (ZONE_TILES / 2 * TILE_UNITS) as i64;
                        let cx = (tx * ZONE_TILES * TILE_UNITS) as i64 + half;
                        let cz = (tz * ZONE_TILES * TILE_UNITS) as i64 + half;
                        let distance = (cx - ex).pow(2) + (cz - ez).pow(2);
                        if distance < best {
                            best = distance;
                            closest = Some((tx, tz, target));
                        }
                    }
                }
                match closest {
                    Some((tx, tz, target)) if target != index => {
                        let offset = ((tx - zx) as i8, (tz - zz) as i8);
                        copies.push((target, model.temp_copy(offset)));
                        model.mark_skipped();
                    }
                    _ => {}
                }
            }
        }

        let count = copies.len();
        for (target, copy) in copies {
            self.zones[target].alpha_models.push(copy);
        }
        count
    }

    /// Drop temporary alpha copies and clear per-frame flags.
    pub(crate) fn post_alpha_pass(&mut self) {
        self.alpha_sort.wait_for_completion();
        for zone in &mut self.zones {
            zone.alpha_models.retain(|m| !m.is_temp());
            zone.alpha_models.iter_mut().for_each(AlphaModel::reset_frame_state);
        }
    }

    /// Queue the per-frame sort of every static alpha model, farthest zones
    /// first. Returns the number of models handed to the job.
    pub(crate) fn sort_static_alpha(
        &mut self,
        system: &JobSystem,
        view: &RenderView,
    ) -> Result<usize, JobError> {
        let job = &self.alpha_sort;
        job.wait_for_completion();
        job.release();

        let mut by_zone: Vec<(i64, usize)> = Vec::new();
        for index in 0..self.zones.len() {
            let (zx, zz) = self.coord(index);
            let zone = &mut self.zones[index];
            if zone.alpha_models.is_empty() {
                continue;
            }
            zone.sort_alpha_models(zx, zz, view.eye);
            let origin = Scene::zone_origin(zx, zz);
            let d = (origin - view.eye).as_i64vec3();
            by_zone.push((d.x * d.x + d.z * d.z, index));
        }
        by_zone.sort_by(|a, b| b.0.cmp(&a.0));

        let models: Vec<AlphaModel> = by_zone
            .iter()
            .flat_map(|&(_, index)| self.zones[index].alpha_models.iter())
            .filter(|m| m.needs_sort())
            .cloned()
            .collect();
        let count = models.len();
        self.alpha_sort.work().prepare(models, view.angles);
        self.alpha_sort.queue_with(system, Priority::High, &[])?;
        Ok(count)
    }

    /// Sort one alpha model on the calling thread unless the sort job got
    /// to it first, in which case wait for the job. Returns whether the
    /// model is sorted.
    pub(crate) fn force_sort(
        &self,
        x: i32,
        z: i32,
        model: usize,
        sorter: &mut FacePrioritySorter,
    ) -> bool {
        let Some(model) = self.zone(x, z).and_then(|zone| zone.alpha_models.get(model)) else {
            return false;
        };
        if model.sorted_faces().is_none() {
            return false;
        }
        if model.is_sorted() || model.try_sort(sorter, self.alpha_sort.work().angles()) {
            return true;
        }
        self.alpha_sort.wait_for_completion();
        model.is_sorted()
    }

    /// Cancel all bakes and free every zone.
    pub(crate) fn destroy(&mut self) {
        self.scene_load.cancel();
        self.streaming.cancel();
        self.invalidation.cancel();
        self.blocking_invalidation.cancel();
        self.alpha_sort.wait_for_completion();
        for zone in &mut self.zones {
            zone.free(self.sink.as_ref());
        }
        self.free_pending_cull();
    }
}

impl Drop for WorldView {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Per-frame job sorting static alpha models. Each model is claimed with
/// a compare-and-set, so the draw thread may sort any model itself.
pub struct StaticAlphaSort {
    models: Mutex<Vec<AlphaModel>>,
    angles: Mutex<CameraAngles>,
    sorter: Mutex<FacePrioritySorter>,
    timings: Arc<StageTimings>,
}

impl StaticAlphaSort {
    fn new(timings: Arc<StageTimings>) -> Self {
        Self {
            models: Mutex::new(Vec::new()),
            angles: Mutex::new(CameraAngles::new(0, 0)),
            sorter: Mutex::new(FacePrioritySorter::new()),
            timings,
        }
    }

    fn prepare(&self, models: Vec<AlphaModel>, angles: CameraAngles) {
        *self.models.lock() = models;
        *self.angles.lock() = angles;
    }

    pub fn angles(&self) -> CameraAngles {
        *self.angles.lock()
    }
}

impl Work for StaticAlphaSort {
    fn label(&self) -> &str {
        "static_alpha_sort"
    }

    fn run(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let angles = self.angles();
        let models = self.models.lock();
        let mut sorter = self.sorter.lock();
        self.timings.time(Stage::StaticAlphaSort, || {
            let mut sorted = 0usize;
            for model in models.iter() {
                ctx.checkpoint()?;
                if model.try_sort(&mut sorter, angles) {
                    sorted += 1;
                }
            }
            tracing::trace!(models = models.len(), sorted, "static alpha sort");
            Ok(())
        })
    }
}
