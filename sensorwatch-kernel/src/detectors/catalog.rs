use crate::models::SensorKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the detectors know about one kind of sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    /// Moving-average alarm fires when the window average drops below this.
    pub threshold: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

impl SensorDescriptor {
    pub fn new(threshold: f64, unit: Option<&str>) -> Self {
        Self {
            threshold,
            unit: unit.map(str::to_string),
        }
    }
}

/// Lookup table from sensor id to descriptor.
///
/// Sensors missing from the table resolve to `fallback`, whose threshold is 0:
/// non-negative sensors such as `cpu` or `ram` can then never breach.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorCatalog {
    entries: HashMap<String, SensorDescriptor>,
    fallback: SensorDescriptor,
}

impl Default for SensorCatalog {
    fn default() -> Self {
        let mut entries = HashMap::new();
        entries.insert("humidity".to_string(), SensorDescriptor::new(60.0, Some("%")));
        entries.insert("temperature".to_string(), SensorDescriptor::new(24.0, Some("°C")));
        Self {
            entries,
            fallback: SensorDescriptor::new(0.0, None),
        }
    }
}

impl SensorCatalog {
    /// Built-in table with `overrides` layered on top.
    pub fn with_overrides(overrides: &HashMap<String, SensorDescriptor>) -> Self {
        let mut catalog = Self::default();
        for (sensor_id, descriptor) in overrides {
            catalog.entries.insert(sensor_id.clone(), descriptor.clone());
        }
        catalog
    }

    pub fn descriptor(&self, key: &SensorKey) -> &SensorDescriptor {
        self.lookup(&key.sensor_id)
    }

    pub fn lookup(&self, sensor_id: &str) -> &SensorDescriptor {
        self.entries.get(sensor_id).unwrap_or(&self.fallback)
    }

    pub fn threshold(&self, key: &SensorKey) -> f64 {
        self.descriptor(key).threshold
    }

    pub fn fallback(&self) -> &SensorDescriptor {
        &self.fallback
    }

    pub fn is_known(&self, sensor_id: &str) -> bool {
        self.entries.contains_key(sensor_id)
    }
}
