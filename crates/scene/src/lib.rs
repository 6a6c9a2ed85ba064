//! Scene: the in-memory world source the streamer bakes from.
//!
//! A [`Scene`] is a square, zone-aligned window of the world holding placed
//! renderables, per-tile roof ids and water, and a content revision per world
//! zone. [`ScenePrep`] indexes it per zone before any bake starts.
//!
//! # Invariants
//! - Scene bases are zone aligned; every stored model lies inside the scene.
//! - Content revisions are keyed by world zone and survive a base shift.
//! - Overrides are resolved once per placed model per bake.

mod index;
mod overrides;
mod scene;

pub use index::{SceneIndex, ScenePrep, ZoneContent};
pub use overrides::{
    AreaOverride, DisplayOverride, NoOverrides, OverrideResolver, OverrideTable, TileArea,
};
pub use scene::{PlacedModel, Scene, SceneError, SceneSettings};

pub fn crate_info() -> &'static str {
    "zonestream-scene v0.1.0"
}
