use crate::models::{AlarmKind, AnomalyEvent, SensorKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

pub const DEFAULT_INACTIVITY_MULTIPLIER: u32 = 10;
/// Concatenated with the sensor id without a separator: `alarms.inactivecpu`.
pub const INACTIVE_ALARM_PREFIX: &str = "alarms.inactive";

/// What happens to a key that stays silent across several scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealarmPolicy {
    /// Alarm on every scan until a reading arrives.
    #[default]
    EveryScan,
    /// Alarm once per silence period; the next `touch` re-arms the key.
    Once,
}

/// Silence tolerated before a key is flagged, given the time since the previous scan.
pub fn inactivity_threshold(elapsed_since_last_scan: Duration, multiplier: u32) -> Duration {
    elapsed_since_last_scan.saturating_mul(multiplier)
}

#[derive(Debug)]
pub struct InactivityDetector {
    last_seen: HashMap<SensorKey, Instant>,
    alarmed: HashSet<SensorKey>,
    multiplier: u32,
    policy: RealarmPolicy,
}

impl Default for InactivityDetector {
    fn default() -> Self {
        Self::new(DEFAULT_INACTIVITY_MULTIPLIER, RealarmPolicy::default())
    }
}

impl InactivityDetector {
    pub fn new(multiplier: u32, policy: RealarmPolicy) -> Self {
        Self {
            last_seen: HashMap::new(),
            alarmed: HashSet::new(),
            multiplier: multiplier.max(1),
            policy,
        }
    }

    pub fn touch(&mut self, key: SensorKey, now: Instant) {
        self.alarmed.remove(&key);
        self.last_seen.insert(key, now);
    }

    /// Yields one alarm per key silent for longer than the adaptive threshold.
    ///
    /// The iterator is lazy; under [`RealarmPolicy::Once`] a key counts as
    /// alarmed only once its event has been pulled.
    pub fn scan<'a>(
        &'a mut self,
        now: Instant,
        elapsed_since_last_scan: Duration,
        timestamp: &'a str,
    ) -> impl Iterator<Item = AnomalyEvent> + 'a {
        let threshold = inactivity_threshold(elapsed_since_last_scan, self.multiplier);
        let policy = self.policy;
        let alarmed = &mut self.alarmed;

        self.last_seen
            .iter()
            .filter(move |(_, seen)| now.saturating_duration_since(**seen) > threshold)
            .filter(move |(key, _)| match policy {
                RealarmPolicy::EveryScan => true,
                RealarmPolicy::Once => alarmed.insert((*key).clone()),
            })
            .map(move |(key, _)| AnomalyEvent {
                machine_id: key.machine_id.clone(),
                metric_name: format!("{INACTIVE_ALARM_PREFIX}{}", key.sensor_id),
                timestamp: timestamp.to_string(),
                value: 1.0,
                kind: AlarmKind::Inactive,
            })
    }

    /// Forgets keys silent for longer than `idle`, returning them.
    pub fn reap(&mut self, now: Instant, idle: Duration) -> Vec<SensorKey> {
        let stale: Vec<SensorKey> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > idle)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.last_seen.remove(key);
            self.alarmed.remove(key);
        }
        stale
    }

    pub fn last_seen(&self, key: &SensorKey) -> Option<Instant> {
        self.last_seen.get(key).copied()
    }

    pub fn tracked_keys(&self) -> usize {
        self.last_seen.len()
    }

    pub fn policy(&self) -> RealarmPolicy {
        self.policy
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "2024-03-01T12:00:00";
    const SECOND: Duration = Duration::from_secs(1);

    fn scan_all(detector: &mut InactivityDetector, now: Instant, elapsed: Duration) -> Vec<AnomalyEvent> {
        detector.scan(now, elapsed, TS).collect()
    }

    #[test]
    fn test_threshold_scales_with_scan_cadence() {
        assert_eq!(inactivity_threshold(SECOND, 10), Duration::from_secs(10));
        assert_eq!(inactivity_threshold(Duration::from_millis(1500), 10), Duration::from_secs(15));
        assert_eq!(inactivity_threshold(Duration::ZERO, 10), Duration::ZERO);
        assert_eq!(inactivity_threshold(Duration::MAX, 10), Duration::MAX);
    }

    #[test]
    fn test_silence_beyond_threshold_alarms_once_per_key() {
        let mut detector = InactivityDetector::default();
        let t1 = Instant::now();
        let key = SensorKey::new("host-1", "cpu");
        detector.touch(key, t1);

        let events = scan_all(&mut detector, t1 + Duration::from_millis(10_001), SECOND);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].machine_id, "host-1");
        assert_eq!(events[0].metric_name, "alarms.inactivecpu");
        assert_eq!(events[0].timestamp, TS);
        assert_eq!(events[0].value, 1.0);
        assert_eq!(events[0].kind, AlarmKind::Inactive);
    }

    #[test]
    fn test_silence_within_threshold_is_quiet() {
        let mut detector = InactivityDetector::default();
        let t1 = Instant::now();
        detector.touch(SensorKey::new("host-1", "cpu"), t1);

        assert!(scan_all(&mut detector, t1 + Duration::from_secs(10), SECOND).is_empty());
        assert!(scan_all(&mut detector, t1 + Duration::from_secs(3), SECOND).is_empty());
        // a stalled scanner widens the threshold
        assert!(scan_all(&mut detector, t1 + Duration::from_secs(25), Duration::from_secs(3)).is_empty());
    }

    #[test]
    fn test_every_scan_policy_realarms() {
        let mut detector = InactivityDetector::default();
        assert_eq!(detector.policy(), RealarmPolicy::EveryScan);
        let t1 = Instant::now();
        detector.touch(SensorKey::new("host-1", "ram"), t1);

        for offset in 11..16 {
            let events = scan_all(&mut detector, t1 + Duration::from_secs(offset), SECOND);
            assert_eq!(events.len(), 1, "scan at +{offset}s");
        }
    }

    #[test]
    fn test_touch_clears_alarm() {
        let mut detector = InactivityDetector::default();
        let t1 = Instant::now();
        let key = SensorKey::new("host-1", "ram");
        detector.touch(key.clone(), t1);
        assert_eq!(scan_all(&mut detector, t1 + Duration::from_secs(11), SECOND).len(), 1);

        detector.touch(key.clone(), t1 + Duration::from_secs(12));
        assert!(scan_all(&mut detector, t1 + Duration::from_secs(13), SECOND).is_empty());
        assert_eq!(detector.last_seen(&key), Some(t1 + Duration::from_secs(12)));
    }

    #[test]
    fn test_once_policy_fires_once_per_silence() {
        let mut detector = InactivityDetector::new(10, RealarmPolicy::Once);
        let t1 = Instant::now();
        let key = SensorKey::new("host-1", "cpu");
        detector.touch(key.clone(), t1);

        assert_eq!(scan_all(&mut detector, t1 + Duration::from_secs(11), SECOND).len(), 1);
        assert!(scan_all(&mut detector, t1 + Duration::from_secs(12), SECOND).is_empty());

        detector.touch(key, t1 + Duration::from_secs(20));
        assert_eq!(scan_all(&mut detector, t1 + Duration::from_secs(31), SECOND).len(), 1);
    }

    #[test]
    fn test_only_silent_keys_alarm() {
        let mut detector = InactivityDetector::default();
        let t1 = Instant::now();
        detector.touch(SensorKey::new("host-1", "cpu"), t1);
        detector.touch(SensorKey::new("host-1", "ram"), t1 + Duration::from_secs(8));
        detector.touch(SensorKey::new("host-2", "cpu"), t1 + Duration::from_secs(1));

        let mut flagged: Vec<String> = scan_all(&mut detector, t1 + Duration::from_secs(12), SECOND)
            .into_iter()
            .map(|e| format!("{}.{}", e.machine_id, e.metric_name))
            .collect();
        flagged.sort();
        assert_eq!(flagged, vec!["host-1.alarms.inactivecpu", "host-2.alarms.inactivecpu"]);
    }

    #[test]
    fn test_scan_does_not_mutate_under_default_policy() {
        let mut detector = InactivityDetector::default();
        let t1 = Instant::now();
        detector.touch(SensorKey::new("host-1", "cpu"), t1);
        let _ = scan_all(&mut detector, t1 + Duration::from_secs(60), SECOND);
        assert_eq!(detector.tracked_keys(), 1);
        assert_eq!(detector.last_seen(&SensorKey::new("host-1", "cpu")), Some(t1));
    }

    #[test]
    fn test_reap_removes_idle_keys() {
        let mut detector = InactivityDetector::default();
        let t1 = Instant::now();
        detector.touch(SensorKey::new("host-1", "cpu"), t1);
        detector.touch(SensorKey::new("host-2", "cpu"), t1 + Duration::from_secs(100));

        let reaped = detector.reap(t1 + Duration::from_secs(150), Duration::from_secs(120));
        assert_eq!(reaped, vec![SensorKey::new("host-1", "cpu")]);
        assert_eq!(detector.tracked_keys(), 1);
        assert!(scan_all(&mut detector, t1 + Duration::from_secs(150), SECOND)
            .iter()
            .all(|e| e.machine_id == "host-2"));
    }
}
