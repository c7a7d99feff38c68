//! Per-device state and the borrowed context handed to components.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::activity::ActivityTracker;
use crate::client::{BatteryInfo, DeviceClient, DeviceSnapshot};
use crate::registry::{EntityRegistry, RepairTracker};
use crate::resubscribe::{CooldownState, ResubscriptionScheduler};
use crate::subscription::SubscriptionManager;
use crate::types::{Device, Reachability};

/// Mutable state of one supervised device.
///
/// Only ever touched while holding the slot's mutex, which serializes
/// timer-driven teardown against activity-driven resubscription.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub reachability: Reachability,
    /// Set while the device runs on polling fallback. Implies the device
    /// holds no subscriptions.
    pub subscriptions_failed: bool,
    pub cooldown: CooldownState,
    pub last_snapshot: Option<DeviceSnapshot>,
    pub battery: Option<BatteryInfo>,
    /// Set once the device is removed. Work queued on the mutex before the
    /// removal must not touch the device afterwards.
    pub detached: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            reachability: Reachability::Available,
            subscriptions_failed: false,
            cooldown: CooldownState::default(),
            last_snapshot: None,
            battery: None,
            detached: false,
        }
    }
}

/// A device together with its client and guarded state.
pub struct DeviceSlot {
    pub device: Device,
    pub client: Arc<dyn DeviceClient>,
    pub state: Mutex<DeviceState>,
}

impl DeviceSlot {
    pub fn new(device: Device, client: Arc<dyn DeviceClient>) -> Self {
        Self {
            device,
            client,
            state: Mutex::new(DeviceState::default()),
        }
    }
}

/// Everything a component needs to act on one device.
pub struct DeviceContext<'a> {
    pub device: &'a Device,
    pub client: &'a dyn DeviceClient,
    pub tracker: &'a ActivityTracker,
    pub subscriptions: &'a SubscriptionManager,
    pub scheduler: &'a ResubscriptionScheduler,
    pub registry: &'a dyn EntityRegistry,
    pub repairs: &'a RepairTracker,
}
