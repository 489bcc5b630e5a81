//! SensorWatch kernel: MQTT sensor ingestion, Graphite forwarding and
//! streaming anomaly detection.

pub mod config;
pub mod decoder;
pub mod detectors;
pub mod engine;
pub mod forwarder;
pub mod health;
pub mod models;
pub mod mqtt;
pub mod state;
pub mod time_codec;
