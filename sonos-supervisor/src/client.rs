//! Device client abstraction
//!
//! The supervisor never speaks UPnP or SOAP itself. Everything it needs from a
//! speaker goes through [`DeviceClient`], one instance per device.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::types::{ServiceChannel, SpeakerId};

/// A subscription accepted by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionGrant {
    /// UPnP subscription id (SID header)
    pub sid: String,
    /// Lease granted by the device, which may differ from the one requested
    pub timeout: Duration,
}

impl SubscriptionGrant {
    pub fn new(sid: impl Into<String>, timeout: Duration) -> Self {
        Self {
            sid: sid.into(),
            timeout,
        }
    }
}

/// State pulled directly from a device when push events are unavailable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub volume: Option<u8>,
    pub muted: Option<bool>,
    pub transport_state: Option<String>,
    pub current_track_uri: Option<String>,
}

/// One member of a zone group as reported by the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneMember {
    pub id: SpeakerId,
    pub zone_name: String,
    /// Bonded satellites and subwoofers are reported but never grouped
    #[serde(default)]
    pub invisible: bool,
}

impl ZoneMember {
    pub fn new(id: impl Into<SpeakerId>, zone_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            zone_name: zone_name.into(),
            invisible: false,
        }
    }

    pub fn invisible(mut self) -> Self {
        self.invisible = true;
        self
    }
}

/// A zone group as reported by the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneGroup {
    pub id: String,
    /// Coordinator flag from the device; may be missing or stale
    pub coordinator: Option<SpeakerId>,
    pub members: Vec<ZoneMember>,
}

/// Household-wide topology: every zone group the device knows about.
pub type TopologySnapshot = Vec<ZoneGroup>;

/// Battery state of a portable speaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
    pub level: u8,
    pub charging: bool,
    pub power_source: String,
}

/// Network operations the supervisor orchestrates on one device.
///
/// Implementations should not apply their own retry logic; the supervisor
/// bounds every call with a timeout and handles recovery itself.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Subscribe to push events on a channel, requesting the given lease
    async fn subscribe(
        &self,
        channel: ServiceChannel,
        requested_timeout: Duration,
    ) -> Result<SubscriptionGrant, ClientError>;

    /// Renew an existing subscription, returning the new lease
    async fn renew(&self, sid: &str, requested_timeout: Duration) -> Result<Duration, ClientError>;

    /// Cancel a subscription on the device
    async fn unsubscribe(&self, sid: &str) -> Result<(), ClientError>;

    /// Pull media, volume and transport state. Must not change device state.
    async fn query_state(&self) -> Result<DeviceSnapshot, ClientError>;

    /// Pull the household zone group topology
    async fn query_topology(&self) -> Result<TopologySnapshot, ClientError>;

    /// Pull battery state. Mains-powered devices return `None`.
    async fn query_battery(&self) -> Result<Option<BatteryInfo>, ClientError> {
        Ok(None)
    }
}
