use serde::{Deserialize, Serialize};

/// Streaming configuration: when zones are reused, deferred and faded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Stagger rebuilds of far zones over several frames after a reload.
    pub zone_streaming: bool,
    /// Zones closer than this to the grid centre are never deferred.
    pub defer_distance_start: f32,
    /// Seconds before the nearest deferred zone is queued.
    pub stagger_base_delay: f32,
    /// Extra seconds added for the farthest deferred zones.
    pub stagger_extra_delay: f32,
    /// Distance in zones at which the extra delay is reached.
    pub stagger_distance_scale: f32,
    /// Reused zones within this many zones of new ground are rebuilt.
    pub edge_margin: i32,
    /// Memory budget for pooled snapshots.
    pub snapshot_budget_mib: u64,
    /// Zones per side of the root grid.
    pub grid_zones: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            zone_streaming: true,
            defer_distance_start: 3.0,
            stagger_base_delay: 0.5,
            stagger_extra_delay: 1.5,
            stagger_distance_scale: 15.0,
            edge_margin: 2,
            snapshot_budget_mib: 64,
            grid_zones: 23,
        }
    }
}

impl StreamConfig {
    /// Seconds a staggered zone waits before its bake is queued.
    pub fn stagger_delay(&self, distance: f32) -> f32 {
        let scale = self.stagger_distance_scale.max(f32::EPSILON);
        self.stagger_base_delay + (distance / scale).clamp(0.0, 1.0) * self.stagger_extra_delay
    }

    pub fn snapshot_budget_bytes(&self) -> u64 {
        self.snapshot_budget_mib * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_config_defaults() {
        let config = StreamConfig::default();
        assert!(config.zone_streaming);
        assert_eq!(config.defer_distance_start, 3.0);
        assert_eq!(config.edge_margin, 2);
        assert_eq!(config.grid_zones, 23);
    }

    #[test]
    fn stagger_delay_grows_with_distance() {
        let config = StreamConfig::default();
        assert_eq!(config.stagger_delay(0.0), 0.5);
        assert_eq!(config.stagger_delay(7.5), 1.25);
        assert_eq!(config.stagger_delay(40.0), 2.0);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: StreamConfig =
            serde_json::from_str(r#"{ "zone_streaming": false, "grid_zones": 5 }"#).unwrap();
        assert!(!config.zone_streaming);
        assert_eq!(config.grid_zones, 5);
        assert_eq!(config.stagger_base_delay, 0.5);
    }
}
