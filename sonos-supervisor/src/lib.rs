//! Sonos Subscription Supervisor
//!
//! Keeps UPnP push subscriptions alive across a household of speakers and
//! falls back to polling when events cannot reach the host.
//!
//! # Features
//!
//! - **Liveness tracking**: every event, poll and discovery ping is recorded
//!   with its source
//! - **Polling fallback**: subscriptions that never deliver an event are
//!   dropped and the device is polled instead
//! - **Cooldown-gated resubscription**: activity on a failed device retries
//!   the subscription, backing off exponentially on repeated failure
//! - **Coalesced regrouping**: bursts of topology changes produce at most one
//!   state write per changed speaker
//!
//! # Architecture
//!
//! ```text
//! DeviceEvent ─┐
//! timer ticks ─┼→ Supervisor → ActivityTracker
//!              │              → PollingFallback
//!              │                  → ResubscriptionScheduler → SubscriptionManager
//!              │              → GroupTopologyCoordinator → EntityRegistry
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use sonos_supervisor::{Device, Supervisor, SupervisorConfig};
//!
//! let supervisor = Supervisor::new(SupervisorConfig::default(), registry)?;
//! supervisor.add_device(device, client).await?;
//!
//! let task = supervisor.start()?;
//! let events = supervisor.event_sender();
//! // ... forward callback server notifications into `events` ...
//! task.shutdown().await?;
//! ```

pub mod activity;
pub mod client;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod logging;
pub mod polling;
pub mod registry;
pub mod resubscribe;
pub mod subscription;
pub mod supervisor;
pub mod topology;
pub mod types;

pub use activity::{ActivityRecord, ActivityTracker};
pub use client::{
    BatteryInfo, DeviceClient, DeviceSnapshot, SubscriptionGrant, TopologySnapshot, ZoneGroup,
    ZoneMember,
};
pub use config::SupervisorConfig;
pub use diagnostics::{DeviceDiagnostics, SupervisorDiagnostics};
pub use error::{ClientError, Result, SubscriptionError, SupervisorError};
pub use event::DeviceEvent;
pub use polling::{PollMode, TickOutcome};
pub use registry::{EntityRegistry, RepairIssue, SUB_FAIL_ISSUE_ID, SUB_FAIL_URL};
pub use resubscribe::{ActivityOutcome, CooldownState};
pub use subscription::{Subscription, SubscriptionSet};
pub use supervisor::{Supervisor, SupervisorTask};
pub use topology::{GroupSnapshot, RegroupChanges, RegroupHandle, RegroupOutcome};
pub use types::{Device, LivenessClass, Reachability, ServiceChannel, SpeakerId};

/// Everything needed to embed the supervisor
pub mod prelude {
    pub use crate::{
        Device, DeviceClient, DeviceEvent, EntityRegistry, LivenessClass, Reachability,
        RepairIssue, ServiceChannel, SpeakerId, Supervisor, SupervisorConfig, SupervisorError,
    };
}
