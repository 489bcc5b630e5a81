//! Wire messages published by the sensor monitor.

use crate::metrics::SensorKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ANNOUNCE_TOPIC: &str = "/sensor_monitors";
pub const TIMESTAMP_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn reading_topic(machine_id: &str, sensor: SensorKind) -> String {
    format!("/sensors/{machine_id}/{}", sensor.id())
}

/// Local wall-clock time in the kernel's wire layout.
pub fn local_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_LAYOUT).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub timestamp: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorAnnouncement {
    pub sensor_id: String,
    pub data_type: String,
    /// Sampling period in milliseconds.
    pub data_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub machine_id: String,
    pub sensors: Vec<SensorAnnouncement>,
}

impl Announcement {
    pub fn new(machine_id: &str, sensors: &[SensorKind], interval: Duration) -> Self {
        let data_interval = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        Self {
            machine_id: machine_id.to_string(),
            sensors: sensors
                .iter()
                .map(|kind| SensorAnnouncement {
                    sensor_id: kind.id().to_string(),
                    data_type: kind.data_type().to_string(),
                    data_interval,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reading_topic() {
        assert_eq!(reading_topic("pi-garage", SensorKind::Cpu), "/sensors/pi-garage/cpu");
        assert_eq!(reading_topic("pi-garage", SensorKind::Ram), "/sensors/pi-garage/ram");
    }

    #[test]
    fn test_announcement_shape() {
        let announcement = Announcement::new(
            "pi-garage",
            &[SensorKind::Cpu, SensorKind::Ram],
            Duration::from_millis(500),
        );
        assert_eq!(
            serde_json::to_value(&announcement).unwrap(),
            json!({
                "machine_id": "pi-garage",
                "sensors": [
                    {"sensor_id": "cpu", "data_type": "float", "data_interval": 500},
                    {"sensor_id": "ram", "data_type": "int", "data_interval": 500}
                ]
            })
        );
    }

    #[test]
    fn test_reading_payload() {
        let reading = SensorReading { timestamp: "2024-03-01T12:00:00".into(), value: 42.5 };
        assert_eq!(
            serde_json::to_value(&reading).unwrap(),
            json!({"timestamp": "2024-03-01T12:00:00", "value": 42.5})
        );
    }

    #[test]
    fn test_local_timestamp_layout() {
        let ts = local_timestamp();
        assert!(chrono::NaiveDateTime::parse_from_str(&ts, TIMESTAMP_LAYOUT).is_ok());
        assert_eq!(ts.len(), 19);
    }
}
