//! Downstream entity registry
//!
//! The supervisor never renders state. It tells the registry which entities
//! need their current state written and when a user-facing repair issue
//! should be shown or withdrawn.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::types::SpeakerId;

/// Issue id raised while any device is running on polling fallback
pub const SUB_FAIL_ISSUE_ID: &str = "subscriptions_failed";

/// Where users can read about the network requirements for push events
pub const SUB_FAIL_URL: &str =
    "https://www.home-assistant.io/integrations/sonos/#network-requirements";

/// A persistent, user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairIssue {
    pub id: &'static str,
    pub learn_more_url: &'static str,
    pub message: String,
}

impl RepairIssue {
    /// The issue raised when a speaker cannot deliver push events
    pub fn subscriptions_failed(zone_name: &str) -> Self {
        Self {
            id: SUB_FAIL_ISSUE_ID,
            learn_more_url: SUB_FAIL_URL,
            message: format!(
                "{zone_name} cannot deliver events to this host, falling back to polling, \
                 functionality may be limited"
            ),
        }
    }
}

/// Receiver of entity notifications.
pub trait EntityRegistry: Send + Sync {
    /// Write the current state of every entity belonging to this speaker
    fn write_state(&self, entity_id: &SpeakerId);

    /// Show a repair issue until it is cleared
    fn raise_issue(&self, issue: RepairIssue);

    /// Withdraw a previously raised issue
    fn clear_issue(&self, issue_id: &str);
}

/// Tracks which devices are failing so the repair issue is raised once and
/// withdrawn only when the last of them recovers.
#[derive(Debug, Default)]
pub struct RepairTracker {
    failing: Mutex<BTreeSet<SpeakerId>>,
}

impl RepairTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a device as failing, raising the issue if it is the first
    pub fn mark_failing(
        &self,
        speaker_id: &SpeakerId,
        zone_name: &str,
        registry: &dyn EntityRegistry,
    ) {
        let first = {
            let mut failing = self.failing.lock();
            let was_empty = failing.is_empty();
            failing.insert(speaker_id.clone()) && was_empty
        };
        if first {
            registry.raise_issue(RepairIssue::subscriptions_failed(zone_name));
        }
    }

    /// Mark a device as healthy, clearing the issue if none is left failing
    pub fn mark_healthy(&self, speaker_id: &SpeakerId, registry: &dyn EntityRegistry) {
        let cleared = {
            let mut failing = self.failing.lock();
            failing.remove(speaker_id) && failing.is_empty()
        };
        if cleared {
            info!("Subscriptions restored on every device, clearing repair issue");
            registry.clear_issue(SUB_FAIL_ISSUE_ID);
        }
    }

    pub fn failing(&self) -> Vec<SpeakerId> {
        self.failing.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Issues {
        raised: Mutex<Vec<RepairIssue>>,
        cleared: Mutex<Vec<String>>,
    }

    impl EntityRegistry for Issues {
        fn write_state(&self, _entity_id: &SpeakerId) {}

        fn raise_issue(&self, issue: RepairIssue) {
            self.raised.lock().push(issue);
        }

        fn clear_issue(&self, issue_id: &str) {
            self.cleared.lock().push(issue_id.to_string());
        }
    }

    #[test]
    fn test_issue_message_names_zone() {
        let issue = RepairIssue::subscriptions_failed("Living Room");
        assert_eq!(issue.id, "subscriptions_failed");
        assert!(issue.message.starts_with("Living Room cannot deliver events"));
        assert!(issue.learn_more_url.ends_with("#network-requirements"));
    }

    #[test]
    fn test_issue_raised_once_and_cleared_after_last_recovery() {
        let registry = Issues::default();
        let tracker = RepairTracker::new();
        let kitchen = SpeakerId::new("RINCON_K");
        let office = SpeakerId::new("RINCON_O");

        tracker.mark_failing(&kitchen, "Kitchen", &registry);
        tracker.mark_failing(&office, "Office", &registry);
        tracker.mark_failing(&kitchen, "Kitchen", &registry);
        assert_eq!(registry.raised.lock().len(), 1);
        assert_eq!(tracker.failing(), vec![kitchen.clone(), office.clone()]);

        tracker.mark_healthy(&kitchen, &registry);
        assert!(registry.cleared.lock().is_empty());

        tracker.mark_healthy(&office, &registry);
        tracker.mark_healthy(&office, &registry);
        assert_eq!(*registry.cleared.lock(), vec![SUB_FAIL_ISSUE_ID.to_string()]);
    }
}
