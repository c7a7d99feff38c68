//! Per-device activity tracking
//!
//! Every inbound sign of life (push event, successful poll, discovery ping)
//! lands here with a short source tag so diagnostics can tell which path
//! last heard from a speaker.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use crate::types::SpeakerId;

/// Source tag for successful fallback polls
pub const SOURCE_FALLBACK_POLL: &str = "fallback_poll";

/// Source tag for availability checks
pub const SOURCE_AVAILABILITY_CHECK: &str = "availability_check";

/// Source tag for battery scans
pub const SOURCE_BATTERY_POLL: &str = "battery_poll";

/// Source tag for the subscribe attempt made when a device is added
pub const SOURCE_SETUP: &str = "setup";

/// Last observed activity for one device.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub last_seen: Instant,
    pub source: String,
    /// Last push event, tracked separately from polls
    pub last_event: Option<Instant>,
}

/// Records last-seen timestamps and answers liveness questions.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    records: RwLock<HashMap<SpeakerId, ActivityRecord>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity from any source
    pub fn record(&self, speaker_id: &SpeakerId, source: &str, now: Instant) {
        let mut records = self.records.write();
        match records.get_mut(speaker_id) {
            Some(record) => {
                record.last_seen = now;
                record.source.clear();
                record.source.push_str(source);
            }
            None => {
                records.insert(
                    speaker_id.clone(),
                    ActivityRecord {
                        last_seen: now,
                        source: source.to_string(),
                        last_event: None,
                    },
                );
            }
        }
    }

    /// Note that the activity just recorded was a push event
    pub fn mark_event(&self, speaker_id: &SpeakerId, now: Instant) {
        if let Some(record) = self.records.write().get_mut(speaker_id) {
            record.last_event = Some(now);
        }
    }

    pub fn get(&self, speaker_id: &SpeakerId) -> Option<ActivityRecord> {
        self.records.read().get(speaker_id).cloned()
    }

    /// Time since the last activity, `None` if never seen
    pub fn idle_for(&self, speaker_id: &SpeakerId, now: Instant) -> Option<Duration> {
        self.records
            .read()
            .get(speaker_id)
            .map(|record| now.saturating_duration_since(record.last_seen))
    }

    /// True when the device was seen within `timeout`.
    ///
    /// A device that was never seen is not alive.
    pub fn is_alive(&self, speaker_id: &SpeakerId, timeout: Duration, now: Instant) -> bool {
        self.idle_for(speaker_id, now)
            .map_or(false, |idle| idle < timeout)
    }

    /// Devices whose last activity is at least `timeout` old
    pub fn stale(&self, timeout: Duration, now: Instant) -> Vec<SpeakerId> {
        self.records
            .read()
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.last_seen) >= timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn remove(&self, speaker_id: &SpeakerId) {
        self.records.write().remove(speaker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_liveness() {
        let tracker = ActivityTracker::new();
        let id = SpeakerId::new("RINCON_1");
        let start = Instant::now();

        assert!(!tracker.is_alive(&id, Duration::from_secs(270), start));

        tracker.record(&id, "discovery", start);
        assert!(tracker.is_alive(&id, Duration::from_secs(270), start));
        assert!(tracker.is_alive(
            &id,
            Duration::from_secs(270),
            start + Duration::from_secs(269)
        ));
        assert!(!tracker.is_alive(
            &id,
            Duration::from_secs(270),
            start + Duration::from_secs(270)
        ));
    }

    #[test]
    fn test_source_is_replaced() {
        let tracker = ActivityTracker::new();
        let id = SpeakerId::new("RINCON_1");
        let start = Instant::now();

        tracker.record(&id, "discovery", start);
        tracker.record(&id, SOURCE_FALLBACK_POLL, start + Duration::from_secs(1));

        let record = tracker.get(&id).unwrap();
        assert_eq!(record.source, "fallback_poll");
        assert!(record.last_event.is_none());
    }

    #[test]
    fn test_event_sets_last_event() {
        let tracker = ActivityTracker::new();
        let id = SpeakerId::new("RINCON_1");
        let now = Instant::now();

        tracker.mark_event(&id, now);
        assert!(tracker.get(&id).is_none());

        tracker.record(&id, "AVTransport subscription", now);
        tracker.mark_event(&id, now);
        let record = tracker.get(&id).unwrap();
        assert_eq!(record.last_event, Some(now));
        assert_eq!(record.last_seen, now);
    }

    #[test]
    fn test_stale_devices() {
        let tracker = ActivityTracker::new();
        let start = Instant::now();
        tracker.record(&SpeakerId::new("RINCON_OLD"), "discovery", start);
        tracker.record(
            &SpeakerId::new("RINCON_NEW"),
            "discovery",
            start + Duration::from_secs(200),
        );

        let stale = tracker.stale(Duration::from_secs(270), start + Duration::from_secs(300));
        assert_eq!(stale, vec![SpeakerId::new("RINCON_OLD")]);

        tracker.remove(&SpeakerId::new("RINCON_OLD"));
        assert!(tracker.get(&SpeakerId::new("RINCON_OLD")).is_none());
    }
}
