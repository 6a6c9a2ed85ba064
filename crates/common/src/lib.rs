//! Common: coordinates, fixed-point trigonometry and colour helpers shared by
//! every zonestream crate.
//!
//! # Invariants
//! - Zone coordinates are tile coordinates shifted right by 3.
//! - Trig tables hold 2048 angle units per turn, scaled by 65536.

mod trig;
mod types;

pub use trig::{ANGLE_UNITS, CameraAngles, cos, sin};
pub use types::{LEVELS, TILE_UNITS, TileCoord, Tint, ZONE_TILES, ZONE_UNITS, ZoneCoord};

pub fn crate_info() -> &'static str {
    "zonestream-common v0.1.0"
}
