//! Host sensors sampled through `sysinfo`.
//!
//! - `cpu`: global CPU usage in percent
//! - `ram`: used memory in bytes

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use sysinfo::System;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Cpu,
    Ram,
}

impl SensorKind {
    pub fn id(self) -> &'static str {
        match self {
            SensorKind::Cpu => "cpu",
            SensorKind::Ram => "ram",
        }
    }

    /// Type advertised in announcements.
    pub fn data_type(self) -> &'static str {
        match self {
            SensorKind::Cpu => "float",
            SensorKind::Ram => "int",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for SensorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(SensorKind::Cpu),
            "ram" => Ok(SensorKind::Ram),
            other => Err(anyhow!("unknown sensor {other:?} (expected cpu or ram)")),
        }
    }
}

/// Parses configured sensor names, dropping duplicates while keeping order.
pub fn parse_sensors(names: &[String]) -> Result<Vec<SensorKind>> {
    let mut kinds = Vec::with_capacity(names.len());
    for name in names {
        let kind: SensorKind = name.parse()?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

/// One sampler per sensor task; owns its `System` so no locking is needed.
pub struct SensorProbe {
    kind: SensorKind,
    sys: System,
}

impl SensorProbe {
    pub fn new(kind: SensorKind) -> Self {
        let mut sys = System::new();
        // CPU usage is a delta between two refreshes; prime the first one
        if kind == SensorKind::Cpu {
            sys.refresh_cpu_usage();
        }
        Self { kind, sys }
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn sample(&mut self) -> f64 {
        let value = match self.kind {
            SensorKind::Cpu => {
                self.sys.refresh_cpu_usage();
                f64::from(self.sys.global_cpu_info().cpu_usage())
            }
            SensorKind::Ram => {
                self.sys.refresh_memory();
                self.sys.used_memory() as f64
            }
        };
        debug!(sensor = %self.kind, value, "sampled");
        value
    }
}
