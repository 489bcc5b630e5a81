//! Conversion between wire timestamps and epoch seconds.
//!
//! Producers stamp readings with `YYYY-MM-DDTHH:MM:SS` in their local wall
//! clock; Graphite wants integer epoch seconds. Anything after the seconds
//! field (a `Z` suffix, fractional seconds) is ignored, the way `strptime`
//! stops at the end of its format.

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

pub const TIMESTAMP_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Error)]
pub enum TimeCodecError {
    #[error("invalid timestamp '{raw}': {source}")]
    InvalidTimestamp {
        raw: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("timestamp '{0}' does not exist in the configured time zone")]
    NonexistentLocalTime(String),
    #[error("epoch seconds {0} out of range")]
    OutOfRange(i64),
}

/// Zone the wire layout is interpreted in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Zone {
    #[default]
    Local,
    Fixed(FixedOffset),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeCodec {
    zone: Zone,
}

impl TimeCodec {
    pub fn local() -> Self {
        Self { zone: Zone::Local }
    }

    pub fn fixed(offset: FixedOffset) -> Self {
        Self {
            zone: Zone::Fixed(offset),
        }
    }

    /// Builds a codec from an optional UTC offset in seconds; `None` means local time.
    pub fn from_offset_secs(offset_secs: Option<i32>) -> Option<Self> {
        match offset_secs {
            None => Some(Self::local()),
            Some(secs) => FixedOffset::east_opt(secs).map(Self::fixed),
        }
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    pub fn to_epoch(&self, raw: &str) -> Result<i64, TimeCodecError> {
        let (naive, _rest) = NaiveDateTime::parse_and_remainder(raw.trim(), TIMESTAMP_LAYOUT)
            .map_err(|source| TimeCodecError::InvalidTimestamp {
                raw: raw.to_string(),
                source,
            })?;

        // A DST fold yields two candidates; take the earlier one like mktime does.
        let epoch = match self.zone {
            Zone::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.timestamp()),
            Zone::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.timestamp()),
        };
        epoch.ok_or_else(|| TimeCodecError::NonexistentLocalTime(raw.to_string()))
    }

    pub fn from_epoch(&self, secs: i64) -> Result<String, TimeCodecError> {
        let utc = DateTime::<Utc>::from_timestamp(secs, 0).ok_or(TimeCodecError::OutOfRange(secs))?;
        Ok(self.format(utc))
    }

    pub fn format(&self, instant: DateTime<Utc>) -> String {
        match self.zone {
            Zone::Local => instant.with_timezone(&Local).format(TIMESTAMP_LAYOUT).to_string(),
            Zone::Fixed(offset) => instant.with_timezone(&offset).format(TIMESTAMP_LAYOUT).to_string(),
        }
    }

    /// Current wall-clock time in wire layout.
    pub fn now(&self) -> String {
        self.format(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc_plus_one() -> TimeCodec {
        TimeCodec::fixed(FixedOffset::east_opt(3600).unwrap())
    }

    #[test]
    fn test_to_epoch_fixed_offset() {
        let codec = TimeCodec::fixed(FixedOffset::east_opt(0).unwrap());
        assert_eq!(codec.to_epoch("2023-11-14T22:13:20").unwrap(), 1_700_000_000);

        // 23:13:20 at UTC+1 is the same instant
        assert_eq!(utc_plus_one().to_epoch("2023-11-14T23:13:20").unwrap(), 1_700_000_000);
    }

    #[test]
    fn test_trailing_input_is_ignored() {
        let codec = utc_plus_one();
        let plain = codec.to_epoch("2024-02-29T12:30:00").unwrap();
        assert_eq!(codec.to_epoch("2024-02-29T12:30:00Z").unwrap(), plain);
        assert_eq!(codec.to_epoch("2024-02-29T12:30:00.250").unwrap(), plain);
        assert_eq!(codec.to_epoch("  2024-02-29T12:30:00 ").unwrap(), plain);
    }

    #[test]
    fn test_invalid_timestamps() {
        let codec = TimeCodec::local();
        for raw in ["", "yesterday", "2024-02-29", "2024-13-01T00:00:00", "2024-02-30T10:00:00"] {
            let err = codec.to_epoch(raw).unwrap_err();
            assert!(
                matches!(err, TimeCodecError::InvalidTimestamp { .. }),
                "unexpected error for {raw:?}: {err}"
            );
        }
    }

    #[test]
    fn test_round_trip_fixed_offset() {
        let codec = utc_plus_one();
        for epoch in [0_i64, 86_399, 1_700_000_000, 1_709_209_800] {
            let wire = codec.from_epoch(epoch).unwrap();
            assert_eq!(codec.to_epoch(&wire).unwrap(), epoch, "wire = {wire}");
        }
        assert_eq!(codec.from_epoch(0).unwrap(), "1970-01-01T01:00:00");
    }

    #[test]
    fn test_round_trip_local() {
        // mid-January and mid-July, away from any DST transition hour
        let codec = TimeCodec::local();
        for epoch in [1_705_320_000_i64, 1_721_044_800] {
            let wire = codec.from_epoch(epoch).unwrap();
            assert_eq!(codec.to_epoch(&wire).unwrap(), epoch);
        }
    }

    #[test]
    fn test_from_offset_secs() {
        assert_eq!(TimeCodec::from_offset_secs(None).unwrap().zone(), Zone::Local);
        assert_eq!(
            TimeCodec::from_offset_secs(Some(-18_000)).unwrap().zone(),
            Zone::Fixed(FixedOffset::west_opt(18_000).unwrap())
        );
        assert!(TimeCodec::from_offset_secs(Some(90_000)).is_none());
    }

    #[test]
    fn test_now_is_parseable() {
        let codec = TimeCodec::local();
        assert!(codec.to_epoch(&codec.now()).is_ok());
    }
}
