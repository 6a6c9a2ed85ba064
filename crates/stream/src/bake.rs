use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use zonestream_common::{LEVELS, ZONE_TILES, ZoneCoord, cos, sin};
use zonestream_jobs::{Job, JobContext, JobError, Work};
use zonestream_model::{FaceCounts, FacePass, FaceWriter, Placement, with_model_faces};
use zonestream_render::{BufferKind, DrawWriter, GpuSink, SinkError};
use zonestream_scene::{DisplayOverride, OverrideResolver, PlacedModel, Scene, ScenePrep};
use zonestream_sort::{AlphaModel, AlphaPlacement, ModelFaces, TileSpan};

use crate::zone::{RoofRange, Zone};

#[derive(Debug, thiserror::Error)]
pub enum BakeError {
    #[error("scene index is not built")]
    MissingIndex,
    #[error("zone ({x}, {z}) is outside the scene")]
    OutOfBounds { x: i32, z: i32 },
    #[error("scene has no model {0}")]
    MissingModel(usize),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// What every bake of one world view shares.
#[derive(Clone)]
pub(crate) struct BakeEnv {
    pub scene: Arc<Scene>,
    pub prep: Job<ScenePrep>,
    pub sink: Arc<dyn GpuSink>,
    pub overrides: Arc<dyn OverrideResolver>,
    pub pending_cull: Arc<Mutex<Vec<Zone>>>,
}

/// Builds a fresh [`Zone`] for one grid cell.
///
/// The zone is handed back through [`ZoneBake::take_output`] and only
/// installed by the frame thread. A cancelled bake's partial zone goes to
/// the pending-cull list instead.
pub struct ZoneBake {
    x: i32,
    z: i32,
    dirty: bool,
    env: BakeEnv,
    output: Mutex<Option<Zone>>,
    failed: AtomicBool,
}

/// One visible model of the zone being baked.
struct Entry<'a> {
    model: &'a PlacedModel,
    display: DisplayOverride,
    placement: Placement,
    roof_id: i32,
    writer: FaceWriter<'a>,
    counts: FaceCounts,
}

impl ZoneBake {
    pub(crate) fn job(env: &BakeEnv, x: i32, z: i32, dirty: bool) -> Job<ZoneBake> {
        Job::new(ZoneBake {
            x,
            z,
            dirty,
            env: env.clone(),
            output: Mutex::new(None),
            failed: AtomicBool::new(false),
        })
    }

    pub fn coord(&self) -> (i32, i32) {
        (self.x, self.z)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn take_output(&self) -> Option<Zone> {
        self.output.lock().take()
    }

    fn bake(&self, zone: &mut Zone, ctx: &JobContext<'_>) -> Result<(), BakeError> {
        let (x, z) = (self.x, self.z);
        let scene = self.env.scene.as_ref();
        let index = self.env.prep.work().index().ok_or(BakeError::MissingIndex)?;
        let content = index
            .get(ZoneCoord::new(x, z))
            .ok_or(BakeError::OutOfBounds { x, z })?;
        zone.revision = content.revision;
        zone.has_water = content.has_water;
        zone.contains_dynamic = content.contains_dynamic;
        ctx.checkpoint()?;

        let origin = Scene::zone_origin(x, z);
        let mut entries = Vec::with_capacity(content.models.len());
        for &i in &content.models {
            let model = scene.models().get(i).ok_or(BakeError::MissingModel(i))?;
            let tile = model.tile();
            let display = self
                .env
                .overrides
                .resolve(model.renderable.id(), scene.world_tile(tile));
            if display.hide {
                continue;
            }
            let placement = Placement {
                offset: model.position - origin,
                orientation: model.orientation,
            };
            let writer = FaceWriter::new(
                model.renderable.as_ref(),
                placement,
                display.tint,
                display.force_transparency,
            );
            entries.push(Entry {
                model,
                display,
                placement,
                roof_id: scene.roof(model.level, tile.x, tile.z),
                counts: FaceCounts::default(),
                writer,
            });
        }
        ctx.checkpoint()?;

        let mut total = FaceCounts::default();
        for entry in &mut entries {
            entry.counts = entry.writer.counts();
            total.opaque += entry.counts.opaque;
            total.alpha += entry.counts.alpha;
        }
        ctx.checkpoint()?;

        let sink = self.env.sink.as_ref();
        let mut opaque = (total.opaque > 0)
            .then(|| DrawWriter::begin_draw(sink, BufferKind::ZoneOpaque, total.opaque))
            .transpose()?;
        let mut alpha = (total.alpha > 0)
            .then(|| DrawWriter::begin_draw(sink, BufferKind::ZoneAlpha, total.alpha))
            .transpose()?;
        ctx.checkpoint()?;

        if let Some(out) = opaque.as_mut() {
            for level in 0..LEVELS {
                let on_level: Vec<&Entry<'_>> = entries
                    .iter()
                    .filter(|e| e.model.level as usize == level && e.counts.opaque > 0)
                    .collect();
                let mut roof_ids: Vec<i32> = on_level
                    .iter()
                    .map(|e| e.roof_id)
                    .filter(|&id| id > 0)
                    .collect();
                roof_ids.sort_unstable();
                roof_ids.dedup();

                for roof_id in roof_ids {
                    let start = out.vertex_count();
                    for entry in on_level.iter().filter(|e| e.roof_id == roof_id) {
                        entry.writer.write_pass(FacePass::Opaque, None, out)?;
                    }
                    zone.roofs[level].push(RoofRange {
                        roof_id,
                        start,
                        end: out.vertex_count(),
                    });
                }
                for entry in on_level.iter().filter(|e| e.roof_id <= 0) {
                    entry.writer.write_pass(FacePass::Opaque, None, out)?;
                }
                zone.level_offsets[level] = out.vertex_count();
                ctx.checkpoint()?;
            }
        }

        if let Some(out) = alpha.as_mut() {
            for entry in entries.iter().filter(|e| e.counts.alpha > 0) {
                let start_vertex = out.vertex_count();
                entry.writer.write_pass(FacePass::Alpha, None, out)?;
                let placement = AlphaPlacement {
                    id: entry.model.renderable.id() as i32,
                    position: entry.placement.offset.round().as_ivec3(),
                    level: entry.model.level,
                    roof_id: entry.roof_id,
                    span: self.span(entry.model),
                    start_vertex,
                };
                if let Some(model) = alpha_model(entry, placement) {
                    zone.alpha_models.push(model);
                }
            }
            ctx.checkpoint()?;
        }

        let dropped = opaque.as_ref().map_or(0, |w| w.dropped_faces())
            + alpha.as_ref().map_or(0, |w| w.dropped_faces());
        zone.opaque = opaque.map(DrawWriter::end).transpose()?;
        zone.alpha = alpha.map(DrawWriter::end).transpose()?;

        tracing::trace!(
            x,
            z,
            models = entries.len(),
            opaque = total.opaque,
            alpha = total.alpha,
            dropped,
            "zone baked"
        );
        Ok(())
    }

    /// Tile span of a model whose footprint reaches into other zones.
    fn span(&self, model: &PlacedModel) -> Option<TileSpan> {
        let (fx, fz) = model.footprint;
        if fx <= 1 && fz <= 1 {
            return None;
        }
        let tile = model.tile();
        let lx = tile.x - self.x * ZONE_TILES;
        let lz = tile.z - self.z * ZONE_TILES;
        let clamp = |v: i32| v.clamp(i8::MIN as i32, i8::MAX as i32) as i8;
        let span = TileSpan {
            lx: clamp(lx),
            lz: clamp(lz),
            ux: clamp(lx + fx as i32 - 1),
            uz: clamp(lz + fz as i32 - 1),
        };
        span.crosses_zones().then_some(span)
    }
}

/// Build the alpha model of an entry from its vertices as placed, so packed
/// faces match the order and rotation of the written alpha pass.
fn alpha_model(entry: &Entry<'_>, placement: AlphaPlacement) -> Option<AlphaModel> {
    let force = entry.display.force_transparency;
    let orientation = entry.placement.orientation & 2047;
    with_model_faces(entry.model.renderable.as_ref(), |faces| {
        if orientation == 0 {
            return AlphaModel::build(faces, placement, force);
        }
        let (s, c) = (sin(orientation) as f32 / 65536.0, cos(orientation) as f32 / 65536.0);
        let n = faces.vertices_x.len().min(faces.vertices_z.len());
        let xs: Vec<f32> = (0..n)
            .map(|v| faces.vertices_z[v] * s + faces.vertices_x[v] * c)
            .collect();
        let zs: Vec<f32> = (0..n)
            .map(|v| faces.vertices_z[v] * c - faces.vertices_x[v] * s)
            .collect();
        let rotated = ModelFaces {
            vertices_x: &xs,
            vertices_z: &zs,
            ..*faces
        };
        AlphaModel::build(&rotated, placement, force)
    })
}

impl Work for ZoneBake {
    fn label(&self) -> &str {
        "zone_bake"
    }

    fn run(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let mut zone = Zone::new();
        zone.dirty = self.dirty;
        let result = self.bake(&mut zone, ctx);
        zone.initialized = true;

        let outcome = match result {
            Ok(()) => Ok(()),
            Err(BakeError::Job(JobError::Cancelled)) => Err(JobError::Cancelled),
            Err(err) => {
                // A failed zone is kept empty so it can still be installed.
                zone.free(self.env.sink.as_ref());
                self.failed.store(true, Ordering::Release);
                Err(JobError::Failed(format!(
                    "zone ({}, {}): {err}",
                    self.x, self.z
                )))
            }
        };
        *self.output.lock() = Some(zone);
        outcome
    }

    fn on_cancel(&self) {
        if self.has_failed() {
            return;
        }
        if let Some(zone) = self.output.lock().take() {
            tracing::debug!(x = self.x, z = self.z, "bake cancelled, partial zone culled");
            self.env.pending_cull.lock().push(zone);
        }
    }
}
