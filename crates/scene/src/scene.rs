use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};
use zonestream_common::{LEVELS, TILE_UNITS, TileCoord, ZONE_TILES, ZONE_UNITS, ZoneCoord};
use zonestream_model::Renderable;

#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error("scene base ({x}, {z}) is not aligned to a zone")]
    UnalignedBase { x: i32, z: i32 },
    #[error("tile ({x}, {z}) on level {level} is outside the scene")]
    OutOfBounds { x: i32, z: i32, level: u8 },
    #[error("scene must be at least one zone wide")]
    Empty,
}

/// Scene-wide state that changes how zones bake. Zones baked under different
/// settings are never reused.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneSettings {
    /// Instanced copies of the world are never mixed with the shared world.
    pub instanced: bool,
    /// Extra map chunks loaded around the scene.
    pub expanded_chunks: u8,
    /// Area the scene is clipped to, if any.
    pub area: Option<u32>,
}

/// A renderable placed in the scene.
#[derive(Clone)]
pub struct PlacedModel {
    pub renderable: Arc<dyn Renderable>,
    /// Position in scene units, relative to the scene origin.
    pub position: Vec3,
    pub level: u8,
    /// Yaw in angle units.
    pub orientation: i32,
    /// Tiles covered along x and z, at least one each.
    pub footprint: (u8, u8),
    /// Animated objects force a blocking rebuild when their zone changes.
    pub dynamic: bool,
}

impl PlacedModel {
    pub fn new(renderable: Arc<dyn Renderable>, position: Vec3, level: u8) -> Self {
        Self {
            renderable,
            position,
            level,
            orientation: 0,
            footprint: (1, 1),
            dynamic: false,
        }
    }

    pub fn with_orientation(mut self, orientation: i32) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_footprint(mut self, x: u8, z: u8) -> Self {
        self.footprint = (x.max(1), z.max(1));
        self
    }

    pub fn animated(mut self) -> Self {
        self.dynamic = true;
        self
    }

    /// Scene-local tile under the model's origin.
    pub fn tile(&self) -> TileCoord {
        TileCoord::new(
            (self.position.x / TILE_UNITS as f32).floor() as i32,
            (self.position.z / TILE_UNITS as f32).floor() as i32,
            self.level,
        )
    }

    /// Scene-local zone owning the model.
    pub fn zone(&self) -> ZoneCoord {
        self.tile().zone()
    }
}

impl std::fmt::Debug for PlacedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlacedModel")
            .field("id", &self.renderable.id())
            .field("position", &self.position)
            .field("level", &self.level)
            .field("dynamic", &self.dynamic)
            .finish()
    }
}

/// A square window of the world, `size_zones` zones per side, anchored at a
/// zone-aligned world tile.
///
/// Content is addressed in scene-local tiles; roofs, water and models are
/// stored per scene, while content revisions are keyed by world zone so
/// they survive the window moving.
#[derive(Debug, Clone)]
pub struct Scene {
    base_x: i32,
    base_z: i32,
    size_zones: usize,
    settings: SceneSettings,
    roofs: Vec<i32>,
    water: BTreeSet<(i32, i32)>,
    models: Vec<PlacedModel>,
    revisions: BTreeMap<ZoneCoord, u64>,
}

impl Scene {
    pub fn new(base_x: i32, base_z: i32, size_zones: usize) -> Result<Self, SceneError> {
        if base_x % ZONE_TILES != 0 || base_z % ZONE_TILES != 0 {
            return Err(SceneError::UnalignedBase {
                x: base_x,
                z: base_z,
            });
        }
        if size_zones == 0 {
            return Err(SceneError::Empty);
        }
        let tiles = size_zones * ZONE_TILES as usize;
        Ok(Self {
            base_x,
            base_z,
            size_zones,
            settings: SceneSettings::default(),
            roofs: vec![0; LEVELS * tiles * tiles],
            water: BTreeSet::new(),
            models: Vec::new(),
            revisions: BTreeMap::new(),
        })
    }

    /// The same world content seen through a window at another base.
    /// Roofs, water and models are re-addressed; anything that falls
    /// outside the new window is dropped.
    pub fn shifted(&self, base_x: i32, base_z: i32) -> Result<Self, SceneError> {
        let mut next = Scene::new(base_x, base_z, self.size_zones)?;
        next.settings = self.settings.clone();
        next.revisions = self.revisions.clone();
        let (dx, dz) = (self.base_x - base_x, self.base_z - base_z);
        let tiles = self.size_tiles();
        for level in 0..LEVELS as u8 {
            for x in 0..tiles {
                for z in 0..tiles {
                    let roof = self.roof(level, x, z);
                    if roof != 0 {
                        let _ = next.set_roof(level, x + dx, z + dz, roof);
                    }
                }
            }
        }
        for &(x, z) in &self.water {
            let _ = next.set_water(x + dx, z + dz);
        }
        let offset = Vec3::new((dx * TILE_UNITS) as f32, 0.0, (dz * TILE_UNITS) as f32);
        for model in &self.models {
            let mut moved = model.clone();
            moved.position += offset;
            let _ = next.add_model(moved);
        }
        Ok(next)
    }

    pub fn with_settings(mut self, settings: SceneSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn base(&self) -> (i32, i32) {
        (self.base_x, self.base_z)
    }

    /// World zone of the scene origin.
    pub fn base_zone(&self) -> ZoneCoord {
        ZoneCoord::new(self.base_x >> 3, self.base_z >> 3)
    }

    pub fn size_zones(&self) -> usize {
        self.size_zones
    }

    pub fn size_tiles(&self) -> i32 {
        self.size_zones as i32 * ZONE_TILES
    }

    pub fn settings(&self) -> &SceneSettings {
        &self.settings
    }

    /// Whether zones baked for `other` can be drawn in this scene.
    pub fn is_compatible_with(&self, other: &Scene) -> bool {
        self.settings == other.settings
    }

    pub fn contains_tile(&self, x: i32, z: i32) -> bool {
        let size = self.size_tiles();
        (0..size).contains(&x) && (0..size).contains(&z)
    }

    pub fn contains_zone(&self, x: i32, z: i32) -> bool {
        let size = self.size_zones as i32;
        (0..size).contains(&x) && (0..size).contains(&z)
    }

    fn roof_index(&self, level: u8, x: i32, z: i32) -> Option<usize> {
        if level as usize >= LEVELS || !self.contains_tile(x, z) {
            return None;
        }
        let size = self.size_tiles() as usize;
        Some((level as usize * size + x as usize) * size + z as usize)
    }

    /// Roof id of a scene-local tile; zero for open sky or out of range.
    pub fn roof(&self, level: u8, x: i32, z: i32) -> i32 {
        self.roof_index(level, x, z).map_or(0, |i| self.roofs[i])
    }

    pub fn set_roof(&mut self, level: u8, x: i32, z: i32, roof_id: i32) -> Result<(), SceneError> {
        let index = self
            .roof_index(level, x, z)
            .ok_or(SceneError::OutOfBounds { x, z, level })?;
        self.roofs[index] = roof_id;
        Ok(())
    }

    /// Fill a rectangle of tiles, inclusive, with one roof id.
    pub fn fill_roof(
        &mut self,
        level: u8,
        (x0, z0): (i32, i32),
        (x1, z1): (i32, i32),
        roof_id: i32,
    ) -> Result<(), SceneError> {
        for x in x0..=x1 {
            for z in z0..=z1 {
                self.set_roof(level, x, z, roof_id)?;
            }
        }
        Ok(())
    }

    pub fn is_water(&self, x: i32, z: i32) -> bool {
        self.water.contains(&(x, z))
    }

    pub fn set_water(&mut self, x: i32, z: i32) -> Result<(), SceneError> {
        if !self.contains_tile(x, z) {
            return Err(SceneError::OutOfBounds { x, z, level: 0 });
        }
        self.water.insert((x, z));
        Ok(())
    }

    /// Add a model. Returns its index.
    pub fn add_model(&mut self, model: PlacedModel) -> Result<usize, SceneError> {
        let tile = model.tile();
        if !self.contains_tile(tile.x, tile.z) || model.level as usize >= LEVELS {
            return Err(SceneError::OutOfBounds {
                x: tile.x,
                z: tile.z,
                level: model.level,
            });
        }
        self.models.push(model);
        Ok(self.models.len() - 1)
    }

    pub fn models(&self) -> &[PlacedModel] {
        &self.models
    }

    /// World tile of a scene-local tile.
    pub fn world_tile(&self, tile: TileCoord) -> TileCoord {
        TileCoord::new(tile.x + self.base_x, tile.z + self.base_z, tile.level)
    }

    /// World zone of a scene-local zone.
    pub fn world_zone(&self, x: i32, z: i32) -> ZoneCoord {
        self.base_zone().offset(x, z)
    }

    /// Content revision of a world zone. Zones are only reused when baked
    /// from the same revision.
    pub fn revision(&self, zone: ZoneCoord) -> u64 {
        self.revisions.get(&zone).copied().unwrap_or(0)
    }

    /// Record a content change in a world zone.
    pub fn touch_zone(&mut self, zone: ZoneCoord) -> u64 {
        let revision = self.revisions.entry(zone).or_insert(0);
        *revision += 1;
        *revision
    }

    /// Corner of a scene-local zone in scene units.
    pub fn zone_origin(x: i32, z: i32) -> Vec3 {
        Vec3::new((x * ZONE_UNITS) as f32, 0.0, (z * ZONE_UNITS) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonestream_model::ModelData;

    fn crate_model() -> Arc<dyn Renderable> {
        Arc::new(ModelData::cuboid(7, 32.0, 64.0, 0x2222, 0))
    }

    #[test]
    fn base_must_be_zone_aligned() {
        assert!(matches!(
            Scene::new(3, 0, 4),
            Err(SceneError::UnalignedBase { x: 3, z: 0 })
        ));
        assert!(matches!(Scene::new(0, 0, 0), Err(SceneError::Empty)));
        assert!(Scene::new(-16, 64, 4).is_ok());
    }

    #[test]
    fn roofs_are_bounds_checked() {
        let mut scene = Scene::new(0, 0, 2).unwrap();
        scene.set_roof(1, 3, 4, 9).unwrap();
        assert_eq!(scene.roof(1, 3, 4), 9);
        assert_eq!(scene.roof(0, 3, 4), 0);
        assert_eq!(scene.roof(1, 99, 4), 0);
        assert!(scene.set_roof(1, 16, 0, 1).is_err());
        assert!(scene.set_roof(4, 0, 0, 1).is_err());
    }

    #[test]
    fn models_land_in_their_zone() {
        let mut scene = Scene::new(0, 0, 4).unwrap();
        let model = PlacedModel::new(crate_model(), Vec3::new(1100.0, 0.0, 2100.0), 0);
        assert_eq!(model.zone(), ZoneCoord::new(1, 2));
        scene.add_model(model).unwrap();
        let outside = PlacedModel::new(crate_model(), Vec3::new(-1.0, 0.0, 0.0), 0);
        assert!(scene.add_model(outside).is_err());
    }

    #[test]
    fn revisions_follow_world_zones() {
        let mut scene = Scene::new(64, 64, 4).unwrap();
        let zone = scene.world_zone(1, 1);
        assert_eq!(zone, ZoneCoord::new(9, 9));
        assert_eq!(scene.revision(zone), 0);
        assert_eq!(scene.touch_zone(zone), 1);

        let moved = scene.shifted(72, 64).unwrap();
        assert_eq!(moved.revision(zone), 1);
    }

    #[test]
    fn shifting_re_addresses_content() {
        let mut scene = Scene::new(0, 0, 4).unwrap();
        scene.set_roof(0, 10, 10, 5).unwrap();
        scene.set_water(0, 0).unwrap();
        scene
            .add_model(PlacedModel::new(crate_model(), Vec3::new(1300.0, 0.0, 64.0), 0))
            .unwrap();

        let moved = scene.shifted(8, 0).unwrap();
        assert_eq!(moved.roof(0, 2, 10), 5);
        // Water at x = 0 fell off the west edge.
        assert!(!moved.is_water(0, 0));
        assert_eq!(moved.models().len(), 1);
        assert_eq!(moved.models()[0].zone(), ZoneCoord::new(0, 0));
    }

    #[test]
    fn settings_decide_compatibility() {
        let a = Scene::new(0, 0, 2).unwrap();
        let b = Scene::new(8, 0, 2).unwrap();
        assert!(a.is_compatible_with(&b));
        let c = b.with_settings(SceneSettings {
            instanced: true,
            ..SceneSettings::default()
        });
        assert!(!a.is_compatible_with(&c));
    }
}
