use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::{IVec3, Vec3};
use zonestream_common::{LEVELS, ZONE_UNITS};
use zonestream_jobs::Job;
use zonestream_model::PendingUploads;
use zonestream_render::{DrawRange, GpuSink};
use zonestream_sort::AlphaModel;

use crate::bake::ZoneBake;

static NEXT_ZONE_ID: AtomicU64 = AtomicU64::new(1);

/// Vertices of one roof within a level of the opaque buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoofRange {
    pub roof_id: i32,
    pub start: u32,
    pub end: u32,
}

/// A bake building a replacement for the zone that holds it.
pub(crate) struct PendingBake {
    pub job: Job<ZoneBake>,
    /// Seconds left before the job is queued; `None` once it has been.
    pub delay: Option<f32>,
}

impl PendingBake {
    /// Cancel the job and free anything it already built.
    pub(crate) fn discard(self, sink: &dyn GpuSink) {
        self.job.cancel();
        if let Some(mut built) = self.job.work().take_output() {
            built.free(sink);
        }
        self.job.release();
    }
}

/// Baked geometry of one 8×8 tile chunk across every level.
///
/// Opaque vertices are laid out level by level; within a level, roof
/// geometry comes first grouped by roof id, followed by everything else.
pub struct Zone {
    id: u64,
    pub initialized: bool,
    /// Scheduled for teardown; never the live occupant of a grid cell.
    pub cull: bool,
    pub dirty: bool,
    /// Rebuild on the next update while this copy keeps drawing.
    pub rebuild: bool,
    pub needs_roof_update: bool,
    pub has_water: bool,
    pub contains_dynamic: bool,
    /// A failed bake of this zone is retried once. Every freshly baked
    /// zone starts with a retry available.
    pub retry_failed_bake: bool,
    /// Content revision this zone was baked from.
    pub revision: u64,
    pub opaque: Option<DrawRange>,
    pub alpha: Option<DrawRange>,
    /// Opaque vertex count at the end of each level.
    pub level_offsets: [u32; LEVELS],
    pub roofs: [Vec<RoofRange>; LEVELS],
    pub alpha_models: Vec<AlphaModel>,
    pending: Arc<PendingUploads>,
    pub(crate) bake: Option<PendingBake>,
}

impl Default for Zone {
    fn default() -> Self {
        Self::new()
    }
}

impl Zone {
    pub fn new() -> Self {
        Self {
            id: NEXT_ZONE_ID.fetch_add(1, Ordering::Relaxed),
            initialized: false,
            cull: false,
            dirty: false,
            rebuild: false,
            needs_roof_update: false,
            has_water: false,
            contains_dynamic: false,
            retry_failed_bake: true,
            revision: 0,
            opaque: None,
            alpha: None,
            level_offsets: [0; LEVELS],
            roofs: Default::default(),
            alpha_models: Vec::new(),
            pending: Arc::new(PendingUploads::new()),
            bake: None,
        }
    }

    /// Process-unique identity, stable for the life of the zone.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot uploads queued against this zone.
    pub fn pending(&self) -> &Arc<PendingUploads> {
        &self.pending
    }

    /// Whether a bake for this zone is waiting or in flight.
    pub fn has_pending_bake(&self) -> bool {
        self.bake.is_some()
    }

    /// Seconds until a staggered bake is queued, if one is waiting.
    pub fn bake_delay(&self) -> Option<f32> {
        self.bake.as_ref().and_then(|b| b.delay)
    }

    pub fn opaque_vertex_count(&self) -> u32 {
        self.level_offsets[LEVELS - 1]
    }

    /// Drain pending uploads, cancel any bake and return buffers to the sink.
    pub fn free(&mut self, sink: &dyn GpuSink) {
        self.pending.complete();
        if let Some(bake) = self.bake.take() {
            bake.discard(sink);
        }
        for range in [self.opaque.take(), self.alpha.take()].into_iter().flatten() {
            sink.release(range.buffer);
        }
        self.alpha_models.clear();
        self.roofs.iter_mut().for_each(Vec::clear);
        self.level_offsets = [0; LEVELS];
    }

    /// Apply a roof id remap to roof ranges and alpha models.
    pub fn update_roofs(&mut self, remap: &BTreeMap<i32, i32>) {
        for range in self.roofs.iter_mut().flatten() {
            if let Some(&id) = remap.get(&range.roof_id) {
                range.roof_id = id;
            }
        }
        for model in &mut self.alpha_models {
            if let Some(&id) = remap.get(&model.roof_id) {
                model.roof_id = id;
            }
        }
    }

    /// Opaque vertex ranges to draw for levels `min..=max`, merged where
    /// contiguous.
    ///
    /// Levels above `current` leave out roofs listed in `hidden_roofs`.
    pub fn opaque_draw_ranges(
        &self,
        min: u8,
        max: u8,
        current: u8,
        hidden_roofs: &BTreeSet<i32>,
    ) -> Vec<(u32, u32)> {
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        let mut push = |start: u32, end: u32| {
            debug_assert!(end >= start);
            if end <= start {
                return;
            }
            match ranges.last_mut() {
                Some(last) if last.1 == start => last.1 = end,
                _ => ranges.push((start, end)),
            }
        };

        for level in min as usize..=(max as usize).min(LEVELS - 1) {
            let level_start = if level == 0 { 0 } else { self.level_offsets[level - 1] };
            let level_end = self.level_offsets[level];
            let roofs = &self.roofs[level];

            if roofs.is_empty() || hidden_roofs.is_empty() || level <= current as usize {
                push(level_start, level_end);
                continue;
            }

            for roof in roofs {
                if roof.roof_id > 0 && !hidden_roofs.contains(&roof.roof_id) {
                    push(roof.start, roof.end);
                }
            }
            let non_roof_start = roofs
                .iter()
                .rev()
                .find(|r| r.roof_id > 0)
                .map_or(level_start, |r| r.end);
            push(non_roof_start, level_end);
        }
        ranges
    }

    /// Order alpha models far to near from `eye`, for a zone at grid
    /// position `(zx, zz)`.
    pub fn sort_alpha_models(&mut self, zx: i32, zz: i32, eye: Vec3) {
        let eye = eye.as_ivec3();
        self.alpha_models.sort_by_cached_key(|m| {
            let d = model_origin(m, zx, zz) - eye;
            std::cmp::Reverse(d.as_i64vec3().length_squared())
        });
    }
}

/// Scene-local position of an alpha model drawn from zone `(zx, zz)`.
pub(crate) fn model_origin(model: &AlphaModel, zx: i32, zz: i32) -> IVec3 {
    let source_x = zx - model.zone_offset.0 as i32;
    let source_z = zz - model.zone_offset.1 as i32;
    model.position + IVec3::new(source_x * ZONE_UNITS, 0, source_z * ZONE_UNITS)
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("id", &self.id)
            .field("initialized", &self.initialized)
            .field("cull", &self.cull)
            .field("dirty", &self.dirty)
            .field("rebuild", &self.rebuild)
            .field("revision", &self.revision)
            .field("opaque_vertices", &self.opaque_vertex_count())
            .field("alpha_models", &self.alpha_models.len())
            .field("baking", &self.bake.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonestream_render::{BufferKind, GpuSink, RecordingSink};
    use zonestream_sort::AlphaPlacement;

    fn roofed_zone() -> Zone {
        let mut zone = Zone::new();
        // level 0: plain; level 1: roofs 4 and 9 then plain geometry.
        zone.level_offsets = [30, 90, 90, 90];
        zone.roofs[1] = vec![
            RoofRange {
                roof_id: 4,
                start: 30,
                end: 48,
            },
            RoofRange {
                roof_id: 9,
                start: 48,
                end: 60,
            },
        ];
        zone
    }

    #[test]
    fn zone_ids_are_unique() {
        assert_ne!(Zone::new().id(), Zone::new().id());
        assert!(Zone::new().retry_failed_bake);
    }

    #[test]
    fn draw_ranges_merge_whole_levels() {
        let zone = roofed_zone();
        let ranges = zone.opaque_draw_ranges(0, 3, 3, &BTreeSet::new());
        assert_eq!(ranges, vec![(0, 90)]);
    }

    #[test]
    fn hidden_roofs_are_skipped_above_the_current_level() {
        let zone = roofed_zone();
        let hidden = BTreeSet::from([4]);
        let ranges = zone.opaque_draw_ranges(0, 3, 0, &hidden);
        assert_eq!(ranges, vec![(0, 30), (48, 90)]);

        // On the roofed level itself everything is drawn.
        let ranges = zone.opaque_draw_ranges(0, 3, 1, &hidden);
        assert_eq!(ranges, vec![(0, 90)]);
    }

    #[test]
    fn non_roof_geometry_starts_after_the_last_roof() {
        let zone = roofed_zone();
        let hidden = BTreeSet::from([4, 9]);
        let ranges = zone.opaque_draw_ranges(1, 1, 0, &hidden);
        assert_eq!(ranges, vec![(60, 90)]);
    }

    #[test]
    fn roof_remap_touches_ranges_and_alpha_models() {
        let mut zone = roofed_zone();
        let mut model = AlphaModel::presorted(AlphaPlacement::at(IVec3::ZERO), 3);
        model.roof_id = 9;
        zone.alpha_models.push(model);

        zone.update_roofs(&BTreeMap::from([(9, 12)]));
        assert_eq!(zone.roofs[1][0].roof_id, 4);
        assert_eq!(zone.roofs[1][1].roof_id, 12);
        assert_eq!(zone.alpha_models[0].roof_id, 12);
    }

    #[test]
    fn free_returns_buffers() {
        let sink = RecordingSink::new();
        let mut zone = Zone::new();
        let id = sink.reserve(BufferKind::ZoneOpaque, 1).unwrap();
        zone.opaque = Some(sink.finish(id).unwrap());
        assert_eq!(sink.live_buffers(), 1);

        zone.free(&sink);
        assert_eq!(sink.live_buffers(), 0);
        assert!(zone.opaque.is_none());
    }

    #[test]
    fn alpha_models_sort_far_to_near() {
        let mut zone = Zone::new();
        for (id, x) in [(0, 100), (1, 900), (2, 500)] {
            let mut placement = AlphaPlacement::at(IVec3::new(x, 0, 0));
            placement.id = id;
            zone.alpha_models.push(AlphaModel::presorted(placement, 3));
        }
        zone.sort_alpha_models(0, 0, Vec3::ZERO);
        let order: Vec<i32> = zone.alpha_models.iter().map(|m| m.id).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn temp_copies_are_placed_relative_to_their_source() {
        let source = AlphaModel::presorted(AlphaPlacement::at(IVec3::new(10, 0, 20)), 3);
        let copy = source.temp_copy((1, 0));
        assert_eq!(model_origin(&source, 2, 3), IVec3::new(2058, 0, 3092));
        // Drawn from zone (3, 3), the copy still sits in zone (2, 3).
        assert_eq!(model_origin(&copy, 3, 3), IVec3::new(2058, 0, 3092));
    }
}
