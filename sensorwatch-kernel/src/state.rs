use crate::detectors::{InactivityDetector, MovingAverageDetector};
use crate::models::SensorKey;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Detector state shared by the ingest worker and the scan ticker.
///
/// Each detector has its own lock and no guard is held across an `.await`.
/// Only [`DetectorState::evict_idle`] holds both, always inactivity first.
#[derive(Clone)]
pub struct DetectorState {
    pub inactivity: Shared<InactivityDetector>,
    pub moving_average: Shared<MovingAverageDetector>,
}

impl DetectorState {
    pub fn new(inactivity: InactivityDetector, moving_average: MovingAverageDetector) -> Self {
        Self {
            inactivity: new_state(inactivity),
            moving_average: new_state(moving_average),
        }
    }

    /// `(inactivity keys, moving-average keys)`
    pub fn tracked_keys(&self) -> (usize, usize) {
        let inactivity = self.inactivity.lock().tracked_keys();
        let moving_average = self.moving_average.lock().tracked_keys();
        (inactivity, moving_average)
    }

    /// Drops keys silent for longer than `idle` from both detectors.
    ///
    /// The inactivity guard stays held until the windows are gone, so a
    /// reading for an evicted key re-registers it only after eviction ends.
    pub fn evict_idle(&self, now: Instant, idle: Duration) -> Vec<SensorKey> {
        let mut inactivity = self.inactivity.lock();
        let evicted = inactivity.reap(now, idle);
        if !evicted.is_empty() {
            let mut moving_average = self.moving_average.lock();
            for key in &evicted {
                moving_average.remove(key);
            }
        }
        evicted
    }
}

impl Default for DetectorState {
    fn default() -> Self {
        Self::new(InactivityDetector::default(), MovingAverageDetector::default())
    }
}
