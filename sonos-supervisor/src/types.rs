//! Core identity types shared by every supervisor component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Unique identifier for a Sonos speaker
///
/// This is the UUID from the UPnP device description, normalized to strip
/// the "uuid:" prefix so ids from SSDP, topology and events compare equal.
/// Ordering is used as the deterministic tie-break when resolving groups.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpeakerId(String);

impl SpeakerId {
    /// Creates a new SpeakerId, normalizing the format
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        match id.strip_prefix("uuid:") {
            Some(stripped) => Self(stripped.to_string()),
            None => Self(id),
        }
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SpeakerId {
    fn from(s: &str) -> Self {
        SpeakerId::new(s)
    }
}

impl From<String> for SpeakerId {
    fn from(s: String) -> Self {
        SpeakerId::new(s)
    }
}

/// UPnP event channels a speaker can push notifications on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceChannel {
    /// Playback state and current track
    AVTransport,
    /// Volume, mute and EQ
    RenderingControl,
    /// Household grouping
    ZoneGroupTopology,
    /// Zone name, battery and microphone state
    DeviceProperties,
    /// Favorites and library container updates
    ContentDirectory,
    /// Alarm list changes
    AlarmClock,
}

impl ServiceChannel {
    /// Every channel, in the order subscriptions are created.
    pub const ALL: [ServiceChannel; 6] = [
        ServiceChannel::AVTransport,
        ServiceChannel::RenderingControl,
        ServiceChannel::ZoneGroupTopology,
        ServiceChannel::DeviceProperties,
        ServiceChannel::ContentDirectory,
        ServiceChannel::AlarmClock,
    ];

    /// Event subscription path on the speaker (port 1400)
    pub fn event_path(&self) -> &'static str {
        match self {
            ServiceChannel::AVTransport => "/MediaRenderer/AVTransport/Event",
            ServiceChannel::RenderingControl => "/MediaRenderer/RenderingControl/Event",
            ServiceChannel::ZoneGroupTopology => "/ZoneGroupTopology/Event",
            ServiceChannel::DeviceProperties => "/DeviceProperties/Event",
            ServiceChannel::ContentDirectory => "/MediaServer/ContentDirectory/Event",
            ServiceChannel::AlarmClock => "/AlarmClock/Event",
        }
    }
}

impl fmt::Display for ServiceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceChannel::AVTransport => "AVTransport",
            ServiceChannel::RenderingControl => "RenderingControl",
            ServiceChannel::ZoneGroupTopology => "ZoneGroupTopology",
            ServiceChannel::DeviceProperties => "DeviceProperties",
            ServiceChannel::ContentDirectory => "ContentDirectory",
            ServiceChannel::AlarmClock => "AlarmClock",
        };
        f.write_str(name)
    }
}

/// How often a device is expected to show signs of life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LivenessClass {
    /// Always-on speaker, checked every availability interval
    #[default]
    Mains,
    /// Portable speaker that may sleep between battery scans
    Battery,
}

/// Whether the supervisor currently considers a device reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    Available,
    Unavailable,
}

/// A discovered speaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: SpeakerId,
    /// Room name shown to users, used in every diagnostic
    pub zone_name: String,
    pub ip_address: IpAddr,
    pub model_name: String,
    pub liveness: LivenessClass,
}

impl Device {
    /// Create a mains-powered device
    pub fn new(id: impl Into<SpeakerId>, zone_name: impl Into<String>, ip_address: IpAddr) -> Self {
        Self {
            id: id.into(),
            zone_name: zone_name.into(),
            ip_address,
            model_name: "Unknown".to_string(),
            liveness: LivenessClass::Mains,
        }
    }

    pub fn with_model(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_liveness(mut self, liveness: LivenessClass) -> Self {
        self.liveness = liveness;
        self
    }

    /// Base URL of the speaker's UPnP endpoint
    pub fn base_url(&self) -> String {
        format!("http://{}:1400", self.ip_address)
    }
}
