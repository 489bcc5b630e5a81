use serde::{Deserialize, Serialize};
use std::fmt;

/// One decoded sensor observation, as published by a sensor monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub machine_id: String,
    pub sensor_id: String,
    /// Producer wall-clock time, wire layout `YYYY-MM-DDTHH:MM:SS`.
    pub timestamp: String,
    pub value: f64,
}

impl Reading {
    pub fn key(&self) -> SensorKey {
        SensorKey::new(&self.machine_id, &self.sensor_id)
    }
}

/// Identity of one reporting source; keys all per-source detector state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorKey {
    pub machine_id: String,
    pub sensor_id: String,
}

impl SensorKey {
    pub fn new(machine_id: impl Into<String>, sensor_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            sensor_id: sensor_id.into(),
        }
    }
}

impl fmt::Display for SensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.machine_id, self.sensor_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    Inactive,
    MovingAverage,
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmKind::Inactive => write!(f, "inactive"),
            AlarmKind::MovingAverage => write!(f, "move_average"),
        }
    }
}

/// An alarm ready for forwarding. `metric_name` already carries the sensor id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyEvent {
    pub machine_id: String,
    pub metric_name: String,
    pub timestamp: String,
    pub value: f64,
    pub kind: AlarmKind,
}
