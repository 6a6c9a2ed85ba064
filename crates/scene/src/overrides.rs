use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zonestream_common::{TileCoord, Tint};

/// How an object is displayed, decided once per bake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayOverride {
    pub hide: bool,
    pub tint: Tint,
    /// Draw every face in the transparent pass.
    pub force_transparency: bool,
}

impl DisplayOverride {
    pub const NONE: DisplayOverride = DisplayOverride {
        hide: false,
        tint: Tint::NONE,
        force_transparency: false,
    };
}

/// Resolves display overrides for placed objects.
pub trait OverrideResolver: Send + Sync {
    fn resolve(&self, object_id: u64, world_tile: TileCoord) -> DisplayOverride;
}

/// Resolver that never overrides anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOverrides;

impl OverrideResolver for NoOverrides {
    fn resolve(&self, _object_id: u64, _world_tile: TileCoord) -> DisplayOverride {
        DisplayOverride::NONE
    }
}

/// A tile rectangle, inclusive, in world tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileArea {
    pub min_x: i32,
    pub min_z: i32,
    pub max_x: i32,
    pub max_z: i32,
}

impl TileArea {
    pub fn contains(&self, tile: TileCoord) -> bool {
        (self.min_x..=self.max_x).contains(&tile.x) && (self.min_z..=self.max_z).contains(&tile.z)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaOverride {
    pub area: TileArea,
    /// Restrict to these objects; empty matches every object.
    #[serde(default)]
    pub objects: Vec<u64>,
    #[serde(flatten)]
    pub display: DisplayOverride,
}

/// Table-driven resolver: per-object entries, then area entries in order.
///
/// ```json
/// { "objects": { "42": { "hide": true } },
///   "areas": [ { "area": { "min_x": 0, "min_z": 0, "max_x": 7, "max_z": 7 },
///                "force_transparency": true } ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideTable {
    pub objects: BTreeMap<u64, DisplayOverride>,
    pub areas: Vec<AreaOverride>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_object(&mut self, object_id: u64, display: DisplayOverride) {
        self.objects.insert(object_id, display);
    }

    pub fn add_area(&mut self, area: TileArea, objects: Vec<u64>, display: DisplayOverride) {
        self.areas.push(AreaOverride {
            area,
            objects,
            display,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.areas.is_empty()
    }
}

impl OverrideResolver for OverrideTable {
    fn resolve(&self, object_id: u64, world_tile: TileCoord) -> DisplayOverride {
        if let Some(display) = self.objects.get(&object_id) {
            return *display;
        }
        self.areas
            .iter()
            .find(|a| {
                a.area.contains(world_tile) && (a.objects.is_empty() || a.objects.contains(&object_id))
            })
            .map_or(DisplayOverride::NONE, |a| a.display)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_entries_win_over_areas() {
        let mut table = OverrideTable::new();
        let area = TileArea {
            min_x: 0,
            min_z: 0,
            max_x: 7,
            max_z: 7,
        };
        table.add_area(
            area,
            Vec::new(),
            DisplayOverride {
                force_transparency: true,
                ..DisplayOverride::NONE
            },
        );
        table.set_object(
            9,
            DisplayOverride {
                hide: true,
                ..DisplayOverride::NONE
            },
        );

        let inside = TileCoord::new(3, 3, 0);
        assert!(table.resolve(9, inside).hide);
        assert!(table.resolve(1, inside).force_transparency);
        assert_eq!(table.resolve(1, TileCoord::new(8, 0, 0)), DisplayOverride::NONE);
    }

    #[test]
    fn area_entries_can_target_objects() {
        let mut table = OverrideTable::new();
        let area = TileArea {
            min_x: -4,
            min_z: -4,
            max_x: 4,
            max_z: 4,
        };
        table.add_area(
            area,
            vec![5],
            DisplayOverride {
                hide: true,
                ..DisplayOverride::NONE
            },
        );
        assert!(table.resolve(5, TileCoord::new(0, 0, 2)).hide);
        assert!(!table.resolve(6, TileCoord::new(0, 0, 2)).hide);
    }

    #[test]
    fn table_loads_from_json() {
        let json = r#"{
            "objects": { "42": { "hide": true } },
            "areas": [ { "area": { "min_x": 0, "min_z": 0, "max_x": 7, "max_z": 7 },
                         "force_transparency": true } ]
        }"#;
        let table: OverrideTable = serde_json::from_str(json).unwrap();
        assert!(table.resolve(42, TileCoord::new(100, 100, 0)).hide);
        let area = table.resolve(1, TileCoord::new(2, 2, 0));
        assert!(area.force_transparency);
        assert!(area.tint.is_none());
    }
}
