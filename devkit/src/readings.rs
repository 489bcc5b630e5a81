use serde_json::json;

pub const TOPIC_ROOT: &str = "/sensors";
const WIRE_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S";

/// Builds the topic and JSON payload a sensor monitor would publish.
#[derive(Debug, Clone)]
pub struct ReadingBuilder {
    machine_id: String,
    sensor_id: String,
    timestamp: String,
    value: f64,
}

impl ReadingBuilder {
    /// Defaults: value `0`, timestamp = local now.
    pub fn new(machine_id: impl Into<String>, sensor_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            sensor_id: sensor_id.into(),
            timestamp: chrono::Local::now().format(WIRE_LAYOUT).to_string(),
            value: 0.0,
        }
    }

    pub fn value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    pub fn timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    pub fn topic(&self) -> String {
        format!("{TOPIC_ROOT}/{}/{}", self.machine_id, self.sensor_id)
    }

    pub fn payload(&self) -> Vec<u8> {
        json!({ "timestamp": self.timestamp, "value": self.value })
            .to_string()
            .into_bytes()
    }
}
