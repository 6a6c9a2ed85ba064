use std::fmt::Write as _;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Samples kept per stage.
const HISTORY: usize = 120;

/// Stages of the streaming frame that are timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    SceneLoad,
    Swap,
    UploadComplete,
    StaticAlphaSort,
    DynamicUpload,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::SceneLoad,
        Stage::Swap,
        Stage::UploadComplete,
        Stage::StaticAlphaSort,
        Stage::DynamicUpload,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::SceneLoad => "scene_load",
            Stage::Swap => "swap",
            Stage::UploadComplete => "upload_complete",
            Stage::StaticAlphaSort => "static_alpha_sort",
            Stage::DynamicUpload => "dynamic_upload",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Rolling window of recent durations.
#[derive(Debug, Clone)]
pub struct FrameTimer {
    history: Vec<Duration>,
    index: usize,
    filled: bool,
}

impl FrameTimer {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: vec![Duration::ZERO; capacity.max(1)],
            index: 0,
            filled: false,
        }
    }

    pub fn record(&mut self, dt: Duration) {
        self.history[self.index] = dt;
        self.index = (self.index + 1) % self.history.len();
        if self.index == 0 {
            self.filled = true;
        }
    }

    fn samples(&self) -> &[Duration] {
        if self.filled {
            &self.history
        } else {
            &self.history[..self.index]
        }
    }

    pub fn average(&self) -> Duration {
        let samples = self.samples();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        samples.iter().sum::<Duration>() / samples.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.samples().iter().copied().max().unwrap_or(Duration::ZERO)
    }

    pub fn min(&self) -> Duration {
        self.samples().iter().copied().min().unwrap_or(Duration::ZERO)
    }

    pub fn count(&self) -> usize {
        self.samples().len()
    }
}

/// One [`FrameTimer`] per [`Stage`], shared between the frame thread and
/// anything reporting on it.
pub struct StageTimings {
    timers: Mutex<Vec<FrameTimer>>,
}

impl Default for StageTimings {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTimings {
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(vec![FrameTimer::new(HISTORY); Stage::ALL.len()]),
        }
    }

    pub fn record(&self, stage: Stage, dt: Duration) {
        self.timers.lock()[stage.slot()].record(dt);
    }

    /// Run `f` and record how long it took.
    pub fn time<R>(&self, stage: Stage, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        self.record(stage, start.elapsed());
        result
    }

    pub fn average(&self, stage: Stage) -> Duration {
        self.timers.lock()[stage.slot()].average()
    }

    pub fn max(&self, stage: Stage) -> Duration {
        self.timers.lock()[stage.slot()].max()
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.timers.lock()[stage.slot()].count()
    }

    /// One line per stage that has samples.
    pub fn summary(&self) -> String {
        let timers = self.timers.lock();
        let mut out = String::from("=== Stage timings ===\n");
        for stage in Stage::ALL {
            let timer = &timers[stage.slot()];
            if timer.count() == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "  {:<18} n={:<4} avg={:?} max={:?}",
                stage.name(),
                timer.count(),
                timer.average(),
                timer.max()
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_timer_tracks_history() {
        let mut timer = FrameTimer::new(3);
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(20));
        timer.record(Duration::from_millis(30));

        assert_eq!(timer.count(), 3);
        assert_eq!(timer.average(), Duration::from_millis(20));
        assert_eq!(timer.max(), Duration::from_millis(30));
        assert_eq!(timer.min(), Duration::from_millis(10));
    }

    #[test]
    fn frame_timer_wraps_around() {
        let mut timer = FrameTimer::new(2);
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(20));
        timer.record(Duration::from_millis(30));

        assert_eq!(timer.count(), 2);
        assert_eq!(timer.average(), Duration::from_millis(25));
    }

    #[test]
    fn stages_are_timed_independently() {
        let timings = StageTimings::new();
        timings.record(Stage::Swap, Duration::from_millis(4));
        let value = timings.time(Stage::SceneLoad, || 7);

        assert_eq!(value, 7);
        assert_eq!(timings.count(Stage::Swap), 1);
        assert_eq!(timings.count(Stage::SceneLoad), 1);
        assert_eq!(timings.count(Stage::DynamicUpload), 0);
        assert_eq!(timings.max(Stage::Swap), Duration::from_millis(4));

        let summary = timings.summary();
        assert!(summary.contains("swap"));
        assert!(!summary.contains("dynamic_upload"));
    }
}
