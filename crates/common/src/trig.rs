use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Angle units per full turn.
pub const ANGLE_UNITS: i32 = 2048;

struct TrigTables {
    sin: Vec<i32>,
    cos: Vec<i32>,
}

static TABLES: LazyLock<TrigTables> = LazyLock::new(|| {
    let step = std::f64::consts::TAU / ANGLE_UNITS as f64;
    let sin = (0..ANGLE_UNITS)
        .map(|i| (65536.0 * (i as f64 * step).sin()) as i32)
        .collect();
    let cos = (0..ANGLE_UNITS)
        .map(|i| (65536.0 * (i as f64 * step).cos()) as i32)
        .collect();
    TrigTables { sin, cos }
});

/// Fixed-point sine of an angle in [`ANGLE_UNITS`], scaled by 65536.
pub fn sin(angle: i32) -> i32 {
    TABLES.sin[(angle & (ANGLE_UNITS - 1)) as usize]
}

/// Fixed-point cosine of an angle in [`ANGLE_UNITS`], scaled by 65536.
pub fn cos(angle: i32) -> i32 {
    TABLES.cos[(angle & (ANGLE_UNITS - 1)) as usize]
}

/// Camera orientation quantised to angle units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CameraAngles {
    pub yaw: i32,
    pub pitch: i32,
}

impl CameraAngles {
    pub fn new(yaw: i32, pitch: i32) -> Self {
        Self {
            yaw: yaw & (ANGLE_UNITS - 1),
            pitch: pitch & (ANGLE_UNITS - 1),
        }
    }

    pub fn from_radians(yaw: f32, pitch: f32) -> Self {
        let scale = ANGLE_UNITS as f32 / std::f32::consts::TAU;
        Self::new((yaw * scale).round() as i32, (pitch * scale).round() as i32)
    }

    pub fn yaw_sin(&self) -> i32 {
        sin(self.yaw)
    }

    pub fn yaw_cos(&self) -> i32 {
        cos(self.yaw)
    }

    pub fn pitch_sin(&self) -> i32 {
        sin(self.pitch)
    }

    pub fn pitch_cos(&self) -> i32 {
        cos(self.pitch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cardinal_angles() {
        assert_eq!(sin(0), 0);
        assert_eq!(cos(0), 65536);
        assert_eq!(sin(512), 65536);
        assert!(cos(512).abs() <= 1);
        assert_eq!(cos(1024), -65536);
    }

    #[test]
    fn angles_wrap() {
        assert_eq!(sin(2048 + 512), sin(512));
        assert_eq!(cos(-512), cos(1536));
        assert_eq!(CameraAngles::new(2049, -1), CameraAngles::new(1, 2047));
    }

    #[test]
    fn radians_round_trip_to_units() {
        let angles = CameraAngles::from_radians(std::f32::consts::PI, 0.0);
        assert_eq!(angles.yaw, 1024);
        assert_eq!(angles.pitch, 0);
    }
}
