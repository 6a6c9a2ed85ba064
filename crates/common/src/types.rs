use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Tiles along one edge of a zone.
pub const ZONE_TILES: i32 = 8;
/// Local units along one edge of a tile.
pub const TILE_UNITS: i32 = 128;
/// Local units along one edge of a zone.
pub const ZONE_UNITS: i32 = ZONE_TILES * TILE_UNITS;
/// Vertical levels baked into every zone.
pub const LEVELS: usize = 4;

/// A zone cell in a world-view grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneCoord {
    pub x: i32,
    pub z: i32,
}

impl ZoneCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn offset(self, dx: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.z + dz)
    }

    /// Euclidean distance between cell indices.
    pub fn distance(self, other: ZoneCoord) -> f32 {
        Vec2::new(self.x as f32, self.z as f32).distance(Vec2::new(other.x as f32, other.z as f32))
    }

    /// Local-space centre of this zone, in units.
    pub fn center_units(self) -> Vec2 {
        Vec2::new(
            (self.x * ZONE_UNITS + ZONE_UNITS / 2) as f32,
            (self.z * ZONE_UNITS + ZONE_UNITS / 2) as f32,
        )
    }
}

/// A tile position in world tile coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: i32,
    pub z: i32,
    pub level: u8,
}

impl TileCoord {
    pub fn new(x: i32, z: i32, level: u8) -> Self {
        Self { x, z, level }
    }

    /// The zone containing this tile.
    pub fn zone(self) -> ZoneCoord {
        ZoneCoord::new(self.x >> 3, self.z >> 3)
    }
}

/// HSL recolour applied on top of a model's face colours.
///
/// Component values of `-1` leave that component untouched. `amount` is the
/// blend factor out of 128.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tint {
    pub hue: i8,
    pub saturation: i8,
    pub luminance: i8,
    pub amount: u8,
}

impl Tint {
    pub const NONE: Tint = Tint {
        hue: -1,
        saturation: -1,
        luminance: -1,
        amount: 0,
    };

    pub fn is_none(&self) -> bool {
        self.amount == 0
    }

    /// Blend a packed 16-bit HSL colour (6 bits hue, 3 bits saturation, 7 bits
    /// luminance) towards this tint.
    pub fn apply(&self, hsl: i32) -> i32 {
        if self.is_none() {
            return hsl;
        }
        let mut hue = (hsl >> 10) & 63;
        let mut sat = (hsl >> 7) & 7;
        let mut lum = hsl & 127;
        let lerp = self.amount as i32;
        if self.hue != -1 {
            hue += (lerp * (self.hue as i32 - hue)) >> 7;
        }
        if self.saturation != -1 {
            sat += (lerp * (self.saturation as i32 - sat)) >> 7;
        }
        if self.luminance != -1 {
            lum += (lerp * (self.luminance as i32 - lum)) >> 7;
        }
        ((hue << 10) | (sat << 7) | lum) & 0xFFFF
    }
}

impl Default for Tint {
    fn default() -> Self {
        Self::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_to_zone() {
        assert_eq!(TileCoord::new(17, 8, 0).zone(), ZoneCoord::new(2, 1));
        assert_eq!(TileCoord::new(-1, 0, 0).zone(), ZoneCoord::new(-1, 0));
    }

    #[test]
    fn zone_distance() {
        let a = ZoneCoord::new(0, 0);
        assert_eq!(a.distance(ZoneCoord::new(3, 4)), 5.0);
        assert_eq!(a.offset(2, -1), ZoneCoord::new(2, -1));
    }

    #[test]
    fn tint_none_is_identity() {
        assert_eq!(Tint::NONE.apply(0x1234), 0x1234);
    }

    #[test]
    fn full_tint_replaces_components() {
        let tint = Tint {
            hue: 10,
            saturation: 2,
            luminance: 100,
            amount: 128,
        };
        let out = tint.apply((40 << 10) | (5 << 7) | 20);
        assert_eq!(out >> 10 & 63, 10);
        assert_eq!(out >> 7 & 7, 2);
        assert_eq!(out & 127, 100);
    }

    #[test]
    fn partial_tint_keeps_unset_components() {
        let tint = Tint {
            hue: -1,
            saturation: -1,
            luminance: 0,
            amount: 64,
        };
        let out = tint.apply((40 << 10) | (5 << 7) | 100);
        assert_eq!(out >> 10 & 63, 40);
        assert_eq!(out >> 7 & 7, 5);
        assert_eq!(out & 127, 50);
    }
}
