//! Streaming anomaly detectors keyed by [`SensorKey`](crate::models::SensorKey).
//!
//! - `inactivity`: flags keys that stopped reporting
//! - `moving_average`: flags keys whose recent average dropped under threshold
//! - `catalog`: per-sensor descriptors (threshold, unit)

pub mod catalog;
pub mod inactivity;
pub mod moving_average;

pub use catalog::{SensorCatalog, SensorDescriptor};
pub use inactivity::{inactivity_threshold, InactivityDetector, RealarmPolicy};
pub use moving_average::MovingAverageDetector;
