use super::catalog::SensorCatalog;
use crate::models::{AlarmKind, AnomalyEvent, SensorKey};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_WINDOW_SIZE: usize = 5;
pub const MOVING_AVERAGE_ALARM_PREFIX: &str = "alarms.move_average";

/// Per-key bounded window of recent values, compared against the catalog threshold.
#[derive(Debug)]
pub struct MovingAverageDetector {
    windows: HashMap<SensorKey, VecDeque<f64>>,
    window_size: usize,
    catalog: SensorCatalog,
}

impl Default for MovingAverageDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE, SensorCatalog::default())
    }
}

impl MovingAverageDetector {
    pub fn new(window_size: usize, catalog: SensorCatalog) -> Self {
        Self {
            windows: HashMap::new(),
            window_size: window_size.max(1),
            catalog,
        }
    }

    /// Records `value` and returns an alarm when the window average is under threshold.
    pub fn evaluate(&mut self, key: &SensorKey, value: f64, timestamp: &str) -> Option<AnomalyEvent> {
        let window = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.window_size + 1));
        window.push_back(value);
        while window.len() > self.window_size {
            window.pop_front();
        }

        let average = window.iter().sum::<f64>() / window.len() as f64;
        let threshold = self.catalog.threshold(key);
        if average < threshold {
            tracing::debug!(key = %key, average, threshold, "moving average under threshold");
            Some(AnomalyEvent {
                machine_id: key.machine_id.clone(),
                metric_name: format!("{MOVING_AVERAGE_ALARM_PREFIX}.{}", key.sensor_id),
                timestamp: timestamp.to_string(),
                value: 1.0,
                kind: AlarmKind::MovingAverage,
            })
        } else {
            None
        }
    }

    pub fn window(&self, key: &SensorKey) -> Option<&VecDeque<f64>> {
        self.windows.get(key)
    }

    pub fn average(&self, key: &SensorKey) -> Option<f64> {
        let window = self.windows.get(key)?;
        if window.is_empty() {
            return None;
        }
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }

    pub fn remove(&mut self, key: &SensorKey) -> bool {
        self.windows.remove(key).is_some()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn catalog(&self) -> &SensorCatalog {
        &self.catalog
    }
}
