//! Serializable per-device report for support dumps.

use std::net::IpAddr;

use serde::Serialize;

use crate::client::{BatteryInfo, DeviceSnapshot};
use crate::polling::PollMode;
use crate::types::{LivenessClass, Reachability, ServiceChannel, SpeakerId};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceDiagnostics {
    pub speaker_id: SpeakerId,
    pub zone_name: String,
    pub ip_address: IpAddr,
    pub model_name: String,
    pub liveness: LivenessClass,
    pub reachability: Reachability,
    pub mode: PollMode,
    pub subscriptions_failed: bool,
    pub subscribed_channels: Vec<ServiceChannel>,
    /// Whether any push event arrived since the current set was created
    pub events_received: bool,
    pub last_activity_source: Option<String>,
    pub idle_secs: Option<f64>,
    pub cooldown_remaining_secs: Option<f64>,
    pub resubscribe_failures: u32,
    pub group: Vec<SpeakerId>,
    pub last_snapshot: Option<DeviceSnapshot>,
    pub battery: Option<BatteryInfo>,
}

/// Report for the whole household.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorDiagnostics {
    pub devices: Vec<DeviceDiagnostics>,
    pub total_subscriptions: usize,
    /// Devices currently holding the repair issue open
    pub failing: Vec<SpeakerId>,
    /// Devices with no activity within the availability timeout
    pub stale: Vec<SpeakerId>,
    pub pending_regroups: usize,
}
