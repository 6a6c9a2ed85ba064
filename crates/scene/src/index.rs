use std::sync::Arc;

use parking_lot::Mutex;
use zonestream_common::{ZONE_TILES, ZoneCoord};
use zonestream_jobs::{Job, JobContext, JobError, Work};

use crate::scene::Scene;

/// What one zone of a scene holds, as seen by a bake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneContent {
    /// Indices into [`Scene::models`], in placement order.
    pub models: Vec<usize>,
    /// Content revision of the zone's world cell.
    pub revision: u64,
    pub has_water: bool,
    /// The zone holds at least one animated model.
    pub contains_dynamic: bool,
}

/// Per-zone lookup of scene content, built once per scene load.
#[derive(Debug, Clone)]
pub struct SceneIndex {
    size: usize,
    zones: Vec<ZoneContent>,
}

impl SceneIndex {
    pub fn build(scene: &Scene) -> Self {
        Self::build_with(scene, |_| Ok(())).unwrap_or_else(|_| Self::empty(scene.size_zones()))
    }

    fn empty(size: usize) -> Self {
        Self {
            size,
            zones: vec![ZoneContent::default(); size * size],
        }
    }

    /// Build the index, calling `checkpoint` once per zone column.
    fn build_with(
        scene: &Scene,
        mut checkpoint: impl FnMut(usize) -> Result<(), JobError>,
    ) -> Result<Self, JobError> {
        let size = scene.size_zones();
        let mut index = Self::empty(size);

        for x in 0..size {
            checkpoint(x)?;
            for z in 0..size {
                let content = &mut index.zones[x * size + z];
                content.revision = scene.revision(scene.world_zone(x as i32, z as i32));
                let (tx, tz) = (x as i32 * ZONE_TILES, z as i32 * ZONE_TILES);
                content.has_water = (tx..tx + ZONE_TILES)
                    .any(|wx| (tz..tz + ZONE_TILES).any(|wz| scene.is_water(wx, wz)));
            }
        }

        for (i, model) in scene.models().iter().enumerate() {
            let zone = model.zone();
            if let Some(content) = index.get_mut(zone) {
                content.models.push(i);
                content.contains_dynamic |= model.dynamic;
            }
        }
        Ok(index)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, zone: ZoneCoord) -> Option<&ZoneContent> {
        self.slot(zone).map(|i| &self.zones[i])
    }

    fn get_mut(&mut self, zone: ZoneCoord) -> Option<&mut ZoneContent> {
        self.slot(zone).map(|i| &mut self.zones[i])
    }

    fn slot(&self, zone: ZoneCoord) -> Option<usize> {
        let size = self.size as i32;
        if (0..size).contains(&zone.x) && (0..size).contains(&zone.z) {
            Some((zone.x * size + zone.z) as usize)
        } else {
            None
        }
    }

    /// Models across every zone.
    pub fn model_count(&self) -> usize {
        self.zones.iter().map(|z| z.models.len()).sum()
    }
}

/// Job that builds the [`SceneIndex`] bakes depend on.
pub struct ScenePrep {
    scene: Arc<Scene>,
    index: Mutex<Option<Arc<SceneIndex>>>,
}

impl ScenePrep {
    pub fn job(scene: Arc<Scene>) -> Job<ScenePrep> {
        Job::new(ScenePrep {
            scene,
            index: Mutex::new(None),
        })
    }

    pub fn scene(&self) -> &Arc<Scene> {
        &self.scene
    }

    /// The built index, or `None` until the job has completed.
    pub fn index(&self) -> Option<Arc<SceneIndex>> {
        self.index.lock().clone()
    }
}

impl Work for ScenePrep {
    fn label(&self) -> &str {
        "scene_prep"
    }

    fn run(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let index = SceneIndex::build_with(&self.scene, |_| ctx.checkpoint())?;
        tracing::debug!(
            zones = index.size() * index.size(),
            models = index.model_count(),
            "scene index built"
        );
        *self.index.lock() = Some(Arc::new(index));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::PlacedModel;
    use glam::Vec3;
    use zonestream_jobs::JobSystem;
    use zonestream_model::{ModelData, Renderable};

    fn scene() -> Scene {
        let mut scene = Scene::new(0, 0, 3).unwrap();
        let model: Arc<dyn Renderable> = Arc::new(ModelData::cuboid(1, 16.0, 16.0, 5, 0));
        scene
            .add_model(PlacedModel::new(model.clone(), Vec3::new(100.0, 0.0, 100.0), 0))
            .unwrap();
        scene
            .add_model(PlacedModel::new(model, Vec3::new(1500.0, 0.0, 2500.0), 1).animated())
            .unwrap();
        scene.set_water(20, 3).unwrap();
        let zone = scene.world_zone(2, 2);
        scene.touch_zone(zone);
        scene
    }

    #[test]
    fn index_groups_models_by_zone() {
        let index = SceneIndex::build(&scene());
        assert_eq!(index.model_count(), 2);
        assert_eq!(index.get(ZoneCoord::new(0, 0)).unwrap().models, vec![0]);
        let dynamic = index.get(ZoneCoord::new(1, 2)).unwrap();
        assert_eq!(dynamic.models, vec![1]);
        assert!(dynamic.contains_dynamic);
        assert!(index.get(ZoneCoord::new(3, 0)).is_none());
    }

    #[test]
    fn index_records_water_and_revisions() {
        let index = SceneIndex::build(&scene());
        assert!(index.get(ZoneCoord::new(2, 0)).unwrap().has_water);
        assert!(!index.get(ZoneCoord::new(0, 0)).unwrap().has_water);
        assert_eq!(index.get(ZoneCoord::new(2, 2)).unwrap().revision, 1);
    }

    #[test]
    fn prep_job_publishes_the_index() {
        let system = JobSystem::inline();
        let job = ScenePrep::job(Arc::new(scene()));
        assert!(job.work().index().is_none());
        job.queue(&system).unwrap();
        job.wait_for_completion();
        assert!(job.ran_to_completion());
        assert_eq!(job.work().index().unwrap().model_count(), 2);
    }
}
