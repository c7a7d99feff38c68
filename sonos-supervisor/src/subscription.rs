//! Subscription lifecycle management
//!
//! The [`SubscriptionManager`] exclusively owns every push subscription. It
//! creates a full set per device or nothing at all, renews leases before they
//! run out, and tears sets down without ever failing locally.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::DeviceClient;
use crate::error::{ClientError, SubscriptionError};
use crate::types::{Device, ServiceChannel, SpeakerId};

/// One live push subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub channel: ServiceChannel,
    /// UPnP subscription id assigned by the device
    pub sid: String,
    /// Event URL the subscription was made against
    pub endpoint: String,
    pub expires_at: Instant,
    pub active: bool,
}

impl Subscription {
    pub fn time_until_expiry(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    pub fn needs_renewal(&self, threshold: Duration, now: Instant) -> bool {
        self.active && self.time_until_expiry(now) <= threshold
    }
}

/// All subscriptions held for one device, at most one per channel.
#[derive(Debug, Clone)]
pub struct SubscriptionSet {
    established_at: Instant,
    first_event_at: Option<Instant>,
    entries: BTreeMap<ServiceChannel, Subscription>,
}

impl SubscriptionSet {
    fn new(established_at: Instant, subscriptions: Vec<Subscription>) -> Self {
        Self {
            established_at,
            first_event_at: None,
            entries: subscriptions
                .into_iter()
                .map(|subscription| (subscription.channel, subscription))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, channel: ServiceChannel) -> Option<&Subscription> {
        self.entries.get(&channel)
    }

    pub fn channels(&self) -> Vec<ServiceChannel> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.values()
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    pub fn first_event_at(&self) -> Option<Instant> {
        self.first_event_at
    }

    /// True when no event arrived within `window` of establishing the set.
    ///
    /// Speakers push their full state right after a subscription is accepted,
    /// so silence past the window means events cannot reach us.
    pub fn is_silent(&self, window: Duration, now: Instant) -> bool {
        self.first_event_at.is_none()
            && now.saturating_duration_since(self.established_at) >= window
    }
}

/// Creates, renews and tears down per-device subscription sets.
pub struct SubscriptionManager {
    channels: Vec<ServiceChannel>,
    /// Lease requested from the device
    lease: Duration,
    /// Bound for each network call
    call_timeout: Duration,
    sets: Mutex<HashMap<SpeakerId, SubscriptionSet>>,
}

impl SubscriptionManager {
    pub fn new(channels: Vec<ServiceChannel>, lease: Duration, call_timeout: Duration) -> Self {
        Self {
            channels,
            lease,
            call_timeout,
            sets: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to every configured channel on the device.
    ///
    /// Either the whole set is created or nothing is: on the first failure the
    /// subscriptions already created in this attempt are torn down and
    /// `CreationFailed` is returned. Timeouts are reported the same way as
    /// connection errors. A device that already holds a set gets it back
    /// unchanged.
    pub async fn subscribe(
        &self,
        device: &Device,
        client: &dyn DeviceClient,
    ) -> Result<SubscriptionSet, SubscriptionError> {
        if let Some(existing) = self.get(&device.id) {
            return Ok(existing);
        }

        let mut created: Vec<Subscription> = Vec::with_capacity(self.channels.len());
        for &channel in &self.channels {
            match self.bounded(client.subscribe(channel, self.lease)).await {
                Ok(grant) => created.push(Subscription {
                    channel,
                    sid: grant.sid,
                    endpoint: format!("{}{}", device.base_url(), channel.event_path()),
                    expires_at: Instant::now() + grant.timeout,
                    active: true,
                }),
                Err(e) => {
                    let error = SubscriptionError::CreationFailed {
                        channel,
                        reason: e.to_string(),
                    };
                    debug!(
                        "Rolling back {} subscription(s) on {} after: {}",
                        created.len(),
                        device.zone_name,
                        error
                    );
                    for subscription in &created {
                        self.teardown(device, client, subscription).await;
                    }
                    self.sets.lock().remove(&device.id);
                    return Err(error);
                }
            }
        }

        let set = SubscriptionSet::new(Instant::now(), created);
        self.sets.lock().insert(device.id.clone(), set.clone());
        debug!(
            "Subscribed to {} channel(s) on {}",
            set.len(),
            device.zone_name
        );
        Ok(set)
    }

    /// Tear down every subscription of the device.
    ///
    /// The local set is dropped before any network call, so this always
    /// succeeds locally and calling it again is a no-op. Remote failures are
    /// logged and swallowed.
    pub async fn unsubscribe_all(&self, device: &Device, client: &dyn DeviceClient) {
        let removed = self.sets.lock().remove(&device.id);
        let Some(set) = removed else {
            return;
        };

        for subscription in set.iter() {
            self.teardown(device, client, subscription).await;
        }
        debug!("Unsubscribed {} channel(s) on {}", set.len(), device.zone_name);
    }

    /// Drop the device's set without contacting it.
    ///
    /// For devices that are unreachable or have rebooted, where the remote
    /// subscriptions are already gone. Returns how many were dropped.
    pub fn forget(&self, speaker_id: &SpeakerId) -> usize {
        self.sets
            .lock()
            .remove(speaker_id)
            .map_or(0, |set| set.len())
    }

    /// Renew subscriptions expiring within `threshold`.
    ///
    /// Returns how many were renewed. A failed renewal drops the whole set
    /// and reports `RenewalFailed`.
    pub async fn renew_expiring(
        &self,
        device: &Device,
        client: &dyn DeviceClient,
        threshold: Duration,
    ) -> Result<usize, SubscriptionError> {
        let now = Instant::now();
        let due: Vec<(ServiceChannel, String)> = {
            let sets = self.sets.lock();
            let Some(set) = sets.get(&device.id) else {
                return Ok(0);
            };
            set.iter()
                .filter(|subscription| subscription.needs_renewal(threshold, now))
                .map(|subscription| (subscription.channel, subscription.sid.clone()))
                .collect()
        };

        let mut renewed = 0;
        for (channel, sid) in due {
            match self.bounded(client.renew(&sid, self.lease)).await {
                Ok(granted) => {
                    let mut sets = self.sets.lock();
                    if let Some(subscription) = sets
                        .get_mut(&device.id)
                        .and_then(|set| set.entries.get_mut(&channel))
                        .filter(|subscription| subscription.sid == sid)
                    {
                        subscription.expires_at = Instant::now() + granted;
                    }
                    renewed += 1;
                }
                Err(e) => {
                    let error = SubscriptionError::RenewalFailed {
                        channel,
                        reason: e.to_string(),
                    };
                    self.unsubscribe_all(device, client).await;
                    return Err(error);
                }
            }
        }

        Ok(renewed)
    }

    /// Note that a push event arrived for the device
    pub fn record_event(&self, speaker_id: &SpeakerId, now: Instant) {
        if let Some(set) = self.sets.lock().get_mut(speaker_id) {
            set.first_event_at.get_or_insert(now);
        }
    }

    /// Current set of the device, `None` when it holds no subscriptions
    pub fn get(&self, speaker_id: &SpeakerId) -> Option<SubscriptionSet> {
        self.sets
            .lock()
            .get(speaker_id)
            .filter(|set| !set.is_empty())
            .cloned()
    }

    pub fn is_subscribed(&self, speaker_id: &SpeakerId) -> bool {
        self.get(speaker_id).is_some()
    }

    /// Number of live subscriptions across all devices
    pub fn total(&self) -> usize {
        self.sets.lock().values().map(SubscriptionSet::len).sum()
    }

    async fn teardown(
        &self,
        device: &Device,
        client: &dyn DeviceClient,
        subscription: &Subscription,
    ) {
        if let Err(e) = self.bounded(client.unsubscribe(&subscription.sid)).await {
            let error = SubscriptionError::TeardownFailed {
                channel: subscription.channel,
                reason: e.to_string(),
            };
            warn!(
                "{} on {} ({})",
                error, device.zone_name, subscription.endpoint
            );
        }
    }

    async fn bounded<T>(
        &self,
        request: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        match tokio::time::timeout(self.call_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(self.call_timeout)),
        }
    }
}
