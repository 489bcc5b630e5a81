use crate::models::Reading;
use serde::Deserialize;
use thiserror::Error;

/// Minimum `/`-separated segments: `"" / sensors / <machine> / <sensor>`.
const MIN_TOPIC_SEGMENTS: usize = 4;
const MACHINE_SEGMENT: usize = 2;
const SENSOR_SEGMENT: usize = 3;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed topic '{topic}': {reason}")]
    MalformedTopic { topic: String, reason: String },
    #[error("malformed payload on '{topic}': {reason}")]
    MalformedPayload { topic: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct WireReading {
    timestamp: String,
    value: f64,
}

/// Parses one inbound publish into a [`Reading`].
pub fn decode(topic: &str, payload: &[u8]) -> Result<Reading, DecodeError> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() < MIN_TOPIC_SEGMENTS {
        return Err(DecodeError::MalformedTopic {
            topic: topic.to_string(),
            reason: format!(
                "expected at least {MIN_TOPIC_SEGMENTS} segments, got {}",
                segments.len()
            ),
        });
    }

    let machine_id = segments[MACHINE_SEGMENT];
    let sensor_id = segments[SENSOR_SEGMENT];
    if machine_id.is_empty() || sensor_id.is_empty() {
        return Err(DecodeError::MalformedTopic {
            topic: topic.to_string(),
            reason: "empty machine or sensor segment".into(),
        });
    }

    let malformed = |reason: String| DecodeError::MalformedPayload {
        topic: topic.to_string(),
        reason,
    };

    let json: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| malformed(e.to_string()))?;
    if !json.is_object() {
        return Err(malformed("payload is not a JSON object".into()));
    }
    let wire = WireReading::deserialize(json).map_err(|e| malformed(e.to_string()))?;

    Ok(Reading {
        machine_id: machine_id.to_string(),
        sensor_id: sensor_id.to_string(),
        timestamp: wire.timestamp,
        value: wire.value,
    })
}
