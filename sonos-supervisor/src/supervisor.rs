//! The supervisor: owner of the device map and driver of every timer.
//!
//! [`Supervisor`] is a cheap handle around shared state. Clone it freely; all
//! clones see the same devices. Call [`Supervisor::start`] to run the timer
//! and event loop in the background, or drive the ticks by hand.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::activity::{ActivityRecord, ActivityTracker, SOURCE_SETUP};
use crate::client::{BatteryInfo, DeviceClient, DeviceSnapshot, TopologySnapshot};
use crate::config::SupervisorConfig;
use crate::device::{DeviceContext, DeviceSlot, DeviceState};
use crate::diagnostics::{DeviceDiagnostics, SupervisorDiagnostics};
use crate::error::{ClientError, Result, SupervisorError};
use crate::event::DeviceEvent;
use crate::polling::{PollMode, PollingFallback, TickOutcome};
use crate::registry::{EntityRegistry, RepairTracker};
use crate::resubscribe::{ActivityOutcome, ResubscriptionScheduler};
use crate::subscription::{SubscriptionManager, SubscriptionSet};
use crate::topology::{
    resolve_groups, GroupSnapshot, GroupTopologyCoordinator, RegroupHandle, RegroupOutcome,
};
use crate::types::{Device, Reachability, SpeakerId};

/// Source tag for a state refresh requested by the caller
pub const SOURCE_REFRESH: &str = "refresh";

#[derive(Debug, Clone, Copy)]
enum Tick {
    Scan,
    Availability,
    Battery,
}

struct Inner {
    config: SupervisorConfig,
    devices: DashMap<SpeakerId, Arc<DeviceSlot>>,
    tracker: ActivityTracker,
    subscriptions: SubscriptionManager,
    scheduler: ResubscriptionScheduler,
    polling: PollingFallback,
    topology: Arc<GroupTopologyCoordinator>,
    repairs: RepairTracker,
    registry: Arc<dyn EntityRegistry>,
    event_tx: mpsc::Sender<DeviceEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<DeviceEvent>>>,
}

/// Keeps push subscriptions alive across a household of speakers.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor that reports entity changes to `registry`.
    pub fn new(config: SupervisorConfig, registry: Arc<dyn EntityRegistry>) -> Result<Self> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::channel(config.event_buffer_size);
        let inner = Inner {
            tracker: ActivityTracker::new(),
            subscriptions: SubscriptionManager::new(
                config.channels.clone(),
                config.subscription_timeout,
                config.subscribe_timeout,
            ),
            scheduler: ResubscriptionScheduler::new(
                config.resub_cooldown_base,
                config.resub_cooldown_max,
            ),
            polling: PollingFallback::new(&config),
            topology: Arc::new(GroupTopologyCoordinator::new()),
            repairs: RepairTracker::new(),
            devices: DashMap::new(),
            registry,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Sender for device events. Events are handled once the loop is started.
    pub fn event_sender(&self) -> mpsc::Sender<DeviceEvent> {
        self.inner.event_tx.clone()
    }

    /// Start supervising a device and subscribe to it.
    ///
    /// A device that is already supervised is treated as rediscovered: the
    /// call counts as `discovery` activity and the new client is dropped.
    /// Subscription failures are not errors here; the device simply starts on
    /// polling fallback.
    pub async fn add_device(
        &self,
        device: Device,
        client: Arc<dyn DeviceClient>,
    ) -> Result<ActivityOutcome> {
        let id = device.id.clone();
        let slot = Arc::new(DeviceSlot::new(device, client));
        let mut state = slot.state.lock().await;

        let inserted = match self.inner.devices.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(slot.clone());
                true
            }
        };
        if !inserted {
            drop(state);
            return self.on_activity(&id, "discovery").await;
        }

        self.inner.topology.insert_standalone(&id);
        info!(
            "Supervising {} ({}, {})",
            slot.device.zone_name, slot.device.model_name, slot.device.ip_address
        );

        let ctx = self.context(&slot);
        ctx.tracker.record(&id, SOURCE_SETUP, Instant::now());
        Ok(self
            .inner
            .scheduler
            .subscribe(&ctx, &mut state, SOURCE_SETUP)
            .await)
    }

    /// Stop supervising a device, tearing its subscriptions down.
    pub async fn remove_device(&self, speaker_id: &SpeakerId) -> Result<()> {
        self.detach(speaker_id, true).await
    }

    /// Every supervised device, ordered by id
    pub fn devices(&self) -> Vec<Device> {
        self.slots()
            .into_iter()
            .map(|slot| slot.device.clone())
            .collect()
    }

    pub fn contains(&self, speaker_id: &SpeakerId) -> bool {
        self.inner.devices.contains_key(speaker_id)
    }

    /// Report activity from `source` and resubscribe if the device needs it.
    pub async fn on_activity(
        &self,
        speaker_id: &SpeakerId,
        source: &str,
    ) -> Result<ActivityOutcome> {
        let slot = self.slot(speaker_id)?;
        let mut state = slot.state.lock().await;
        if state.detached {
            return Err(SupervisorError::DeviceNotFound(speaker_id.clone()));
        }
        let ctx = self.context(&slot);
        Ok(self.inner.scheduler.on_activity(&ctx, &mut state, source).await)
    }

    /// Allow the next activity to resubscribe immediately
    pub async fn reset_cooldown(&self, speaker_id: &SpeakerId) -> Result<()> {
        let slot = self.slot(speaker_id)?;
        let mut state = slot.state.lock().await;
        state.cooldown.reset();
        debug!("Resubscription cooldown cleared for {}", slot.device.zone_name);
        Ok(())
    }

    /// Pull the device's state now. Success counts as activity.
    pub async fn refresh(&self, speaker_id: &SpeakerId) -> Result<DeviceSnapshot> {
        let slot = self.slot(speaker_id)?;
        let mut state = slot.state.lock().await;
        let ctx = self.context(&slot);
        let snapshot = self.inner.polling.query(&ctx).await?;
        state.last_snapshot = Some(snapshot.clone());
        self.inner
            .scheduler
            .on_activity(&ctx, &mut state, SOURCE_REFRESH)
            .await;
        Ok(snapshot)
    }

    /// Current subscriptions of the device, `None` when it has none
    pub fn subscriptions(&self, speaker_id: &SpeakerId) -> Option<SubscriptionSet> {
        self.inner.subscriptions.get(speaker_id)
    }

    pub async fn subscriptions_failed(&self, speaker_id: &SpeakerId) -> Result<bool> {
        self.with_state(speaker_id, |state| state.subscriptions_failed)
            .await
    }

    pub async fn reachability(&self, speaker_id: &SpeakerId) -> Result<Reachability> {
        self.with_state(speaker_id, |state| state.reachability).await
    }

    pub async fn cooldown_remaining(&self, speaker_id: &SpeakerId) -> Result<Option<Duration>> {
        self.with_state(speaker_id, |state| state.cooldown.remaining(Instant::now()))
            .await
    }

    pub async fn last_snapshot(&self, speaker_id: &SpeakerId) -> Result<Option<DeviceSnapshot>> {
        self.with_state(speaker_id, |state| state.last_snapshot.clone())
            .await
    }

    pub async fn battery(&self, speaker_id: &SpeakerId) -> Result<Option<BatteryInfo>> {
        self.with_state(speaker_id, |state| state.battery.clone())
            .await
    }

    pub fn mode(&self, speaker_id: &SpeakerId) -> Result<PollMode> {
        let slot = self.slot(speaker_id)?;
        Ok(PollingFallback::mode(&self.context(&slot)))
    }

    pub fn activity(&self, speaker_id: &SpeakerId) -> Option<ActivityRecord> {
        self.inner.tracker.get(speaker_id)
    }

    pub fn group_of(&self, speaker_id: &SpeakerId) -> Option<GroupSnapshot> {
        self.inner.topology.group_of(speaker_id)
    }

    /// The device's coordinator, `None` if it coordinates itself
    pub fn coordinator_of(&self, speaker_id: &SpeakerId) -> Option<SpeakerId> {
        self.group_of(speaker_id)
            .and_then(|group| group.coordinator_for(speaker_id).cloned())
    }

    /// Recompute groups from the topology seen by `seed`.
    ///
    /// Uses `hint` when the caller already has the topology, otherwise asks
    /// the seed device. A newer call for the same seed supersedes this one.
    pub fn recompute_groups(
        &self,
        seed: &SpeakerId,
        hint: Option<TopologySnapshot>,
    ) -> RegroupHandle {
        let topology = &self.inner.topology;
        let generation = topology.begin(seed);

        let supervisor = self.clone();
        let task_seed = seed.clone();
        let handle =
            tokio::spawn(async move { supervisor.regroup(task_seed, generation, hint).await });

        topology.attach(seed, generation, handle.abort_handle());
        RegroupHandle::new(handle, seed.clone(), generation, topology.clone())
    }

    /// Run one scan tick over every device
    pub async fn tick_scan(&self) -> Vec<(SpeakerId, TickOutcome)> {
        self.run_tick(Tick::Scan).await
    }

    /// Run one availability check over every device
    pub async fn tick_availability(&self) -> Vec<(SpeakerId, TickOutcome)> {
        self.run_tick(Tick::Availability).await
    }

    /// Run one battery scan over every device
    pub async fn tick_battery(&self) -> Vec<(SpeakerId, TickOutcome)> {
        self.run_tick(Tick::Battery).await
    }

    /// Handle one device event. Events for unknown devices are ignored.
    pub async fn handle_event(&self, event: DeviceEvent) {
        let Ok(slot) = self.slot(event.speaker_id()) else {
            debug!("Ignoring event for unknown device {}", event.speaker_id());
            return;
        };
        let source = event.source_tag();

        match event {
            DeviceEvent::Notification { speaker_id, .. } => {
                let now = Instant::now();
                let mut state = slot.state.lock().await;
                if state.detached {
                    return;
                }
                self.inner.subscriptions.record_event(&speaker_id, now);
                let ctx = self.context(&slot);
                self.inner.scheduler.on_activity(&ctx, &mut state, &source).await;
                self.inner.tracker.mark_event(&speaker_id, now);
            }
            DeviceEvent::TopologyChanged {
                speaker_id,
                topology,
            } => {
                {
                    let mut state = slot.state.lock().await;
                    if state.detached {
                        return;
                    }
                    self.inner.subscriptions.record_event(&speaker_id, Instant::now());
                    let ctx = self.context(&slot);
                    self.inner.scheduler.on_activity(&ctx, &mut state, &source).await;
                }
                self.recompute_groups(&speaker_id, topology);
            }
            DeviceEvent::Discovered { speaker_id } => {
                if let Err(e) = self.on_activity(&speaker_id, &source).await {
                    debug!("Discovery of {} not handled: {}", speaker_id, e);
                }
            }
            DeviceEvent::Rebooted { speaker_id } => {
                {
                    let mut state = slot.state.lock().await;
                    if state.detached {
                        return;
                    }
                    let dropped = self.inner.subscriptions.forget(&speaker_id);
                    info!(
                        "{} rebooted, dropping {} stale subscription(s)",
                        slot.device.zone_name, dropped
                    );
                    state.subscriptions_failed = true;
                    state.cooldown.reset();
                    let ctx = self.context(&slot);
                    self.inner.scheduler.on_activity(&ctx, &mut state, &source).await;
                }
                self.recompute_groups(&speaker_id, None);
            }
            DeviceEvent::Vanished { speaker_id, reason } => {
                info!("{} vanished: {}", slot.device.zone_name, reason);
                if let Err(e) = self.detach(&speaker_id, false).await {
                    debug!("Vanished device {} already gone: {}", speaker_id, e);
                }
            }
        }
    }

    /// Spawn the timer and event loop.
    ///
    /// Fails with `AlreadyRunning` if the loop was started before.
    pub fn start(&self) -> Result<SupervisorTask> {
        let events = self
            .inner
            .event_rx
            .lock()
            .take()
            .ok_or(SupervisorError::AlreadyRunning)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let background_task = tokio::spawn(self.clone().run(events, shutdown_rx));

        Ok(SupervisorTask {
            supervisor: self.clone(),
            background_task: Some(background_task),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Tear down every subscription, leaving devices supervised on polling.
    ///
    /// The next activity on each device resubscribes it. No repair issue is
    /// raised since nothing failed.
    pub async fn unsubscribe_all(&self) {
        let slots = self.slots();
        join_all(slots.iter().map(|slot| async move {
            let mut state = slot.state.lock().await;
            if state.detached {
                return;
            }
            self.inner
                .subscriptions
                .unsubscribe_all(&slot.device, slot.client.as_ref())
                .await;
            state.subscriptions_failed = true;
            state.cooldown.reset();
        }))
        .await;
    }

    /// Snapshot of every device for support dumps
    pub async fn diagnostics(&self) -> SupervisorDiagnostics {
        let now = Instant::now();
        let mut devices = Vec::new();

        for slot in self.slots() {
            let state = slot.state.lock().await.clone();
            let id = &slot.device.id;
            let set = self.inner.subscriptions.get(id);
            let activity = self.inner.tracker.get(id);

            devices.push(DeviceDiagnostics {
                speaker_id: id.clone(),
                zone_name: slot.device.zone_name.clone(),
                ip_address: slot.device.ip_address,
                model_name: slot.device.model_name.clone(),
                liveness: slot.device.liveness,
                reachability: state.reachability,
                mode: PollingFallback::mode(&self.context(&slot)),
                subscriptions_failed: state.subscriptions_failed,
                subscribed_channels: set
                    .as_ref()
                    .map(SubscriptionSet::channels)
                    .unwrap_or_default(),
                events_received: set
                    .as_ref()
                    .map_or(false, |set| set.first_event_at().is_some()),
                last_activity_source: activity.as_ref().map(|record| record.source.clone()),
                idle_secs: activity
                    .as_ref()
                    .map(|record| now.saturating_duration_since(record.last_seen).as_secs_f64()),
                cooldown_remaining_secs: state.cooldown.remaining(now).map(|d| d.as_secs_f64()),
                resubscribe_failures: state.cooldown.failures(),
                group: self
                    .group_of(id)
                    .map(|group| group.members().to_vec())
                    .unwrap_or_default(),
                last_snapshot: state.last_snapshot,
                battery: state.battery,
            });
        }

        SupervisorDiagnostics {
            devices,
            total_subscriptions: self.inner.subscriptions.total(),
            failing: self.inner.repairs.failing(),
            stale: self.stale_devices(now),
            pending_regroups: self.inner.topology.pending(),
        }
    }

    fn stale_devices(&self, now: Instant) -> Vec<SpeakerId> {
        let mut stale = self
            .inner
            .tracker
            .stale(self.inner.config.availability_timeout, now);
        stale.sort();
        stale
    }

    fn context<'a>(&'a self, slot: &'a DeviceSlot) -> DeviceContext<'a> {
        let inner = &*self.inner;
        DeviceContext {
            device: &slot.device,
            client: slot.client.as_ref(),
            tracker: &inner.tracker,
            subscriptions: &inner.subscriptions,
            scheduler: &inner.scheduler,
            registry: inner.registry.as_ref(),
            repairs: &inner.repairs,
        }
    }

    fn slot(&self, speaker_id: &SpeakerId) -> Result<Arc<DeviceSlot>> {
        self.inner
            .devices
            .get(speaker_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SupervisorError::DeviceNotFound(speaker_id.clone()))
    }

    fn slots(&self) -> Vec<Arc<DeviceSlot>> {
        let mut slots: Vec<Arc<DeviceSlot>> = self
            .inner
            .devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        slots.sort_by(|a, b| a.device.id.cmp(&b.device.id));
        slots
    }

    fn zone_name(&self, speaker_id: &SpeakerId) -> String {
        self.inner
            .devices
            .get(speaker_id)
            .map(|entry| entry.device.zone_name.clone())
            .unwrap_or_else(|| speaker_id.to_string())
    }

    async fn with_state<T>(
        &self,
        speaker_id: &SpeakerId,
        read: impl FnOnce(&DeviceState) -> T,
    ) -> Result<T> {
        let slot = self.slot(speaker_id)?;
        let state = slot.state.lock().await;
        Ok(read(&*state))
    }

    async fn run_tick(&self, tick: Tick) -> Vec<(SpeakerId, TickOutcome)> {
        let slots = self.slots();
        let polling = &self.inner.polling;

        join_all(slots.iter().map(|slot| async move {
            let mut state = slot.state.lock().await;
            let outcome = if state.detached {
                TickOutcome::Skipped
            } else {
                let ctx = self.context(slot);
                match tick {
                    Tick::Scan => polling.tick(&ctx, &mut state).await,
                    Tick::Availability => polling.check_availability(&ctx, &mut state).await,
                    Tick::Battery => polling.scan_battery(&ctx, &mut state).await,
                }
            };
            (slot.device.id.clone(), outcome)
        }))
        .await
    }

    async fn detach(&self, speaker_id: &SpeakerId, teardown: bool) -> Result<()> {
        let (_, slot) = self
            .inner
            .devices
            .remove(speaker_id)
            .ok_or_else(|| SupervisorError::DeviceNotFound(speaker_id.clone()))?;

        let mut state = slot.state.lock().await;
        state.detached = true;
        if teardown {
            self.inner
                .subscriptions
                .unsubscribe_all(&slot.device, slot.client.as_ref())
                .await;
        } else {
            self.inner.subscriptions.forget(speaker_id);
        }
        drop(state);

        let registry = self.inner.registry.as_ref();
        self.inner.tracker.remove(speaker_id);
        self.inner.repairs.mark_healthy(speaker_id, registry);
        for peer in self.inner.topology.remove_device(speaker_id) {
            registry.write_state(&peer);
        }
        info!("Stopped supervising {}", slot.device.zone_name);
        Ok(())
    }

    async fn regroup(
        self,
        seed: SpeakerId,
        generation: u64,
        hint: Option<TopologySnapshot>,
    ) -> Result<RegroupOutcome> {
        tokio::time::sleep(self.inner.config.regroup_debounce).await;

        let topology = match hint {
            Some(topology) => topology,
            None => match self.fetch_topology(&seed).await {
                Ok(topology) => topology,
                Err(e) => {
                    self.inner.topology.abandon(&seed, generation);
                    warn!("Could not read topology from {}: {}", self.zone_name(&seed), e);
                    return Err(e);
                }
            },
        };

        let known: BTreeSet<SpeakerId> = self
            .inner
            .devices
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let resolved = resolve_groups(&topology, &known);

        let Some(changes) = self.inner.topology.apply(&seed, generation, resolved) else {
            return Ok(RegroupOutcome::Superseded);
        };
        if changes.is_empty() {
            debug!("Topology from {} unchanged", self.zone_name(&seed));
            return Ok(RegroupOutcome::Unchanged);
        }

        for speaker_id in &changes.changed_devices {
            self.inner.registry.write_state(speaker_id);
        }
        for group in &changes.changed_groups {
            let members: Vec<String> = group
                .members()
                .iter()
                .map(|member| self.zone_name(member))
                .collect();
            info!("Regrouped {}: {:?}", self.zone_name(group.coordinator()), members);
        }
        Ok(RegroupOutcome::Applied(changes))
    }

    async fn fetch_topology(&self, seed: &SpeakerId) -> Result<TopologySnapshot> {
        let slot = self.slot(seed)?;
        let limit = self.inner.config.subscribe_timeout;
        let result = match timeout(limit, slot.client.query_topology()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(limit)),
        };
        result.map_err(|e| SupervisorError::DeviceUnreachable {
            speaker_id: seed.clone(),
            reason: e.to_string(),
        })
    }

    async fn run(
        self,
        mut events: mpsc::Receiver<DeviceEvent>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let config = &self.inner.config;
        let start = Instant::now();
        let mut scan = interval_at(start + config.scan_interval, config.scan_interval);
        let mut availability = interval_at(
            start + config.availability_check_interval,
            config.availability_check_interval,
        );
        let mut battery = interval_at(
            start + config.battery_scan_interval,
            config.battery_scan_interval,
        );
        for timer in [&mut scan, &mut availability, &mut battery] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        info!("Supervisor started with {} device(s)", self.inner.devices.len());

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let supervisor = self.clone();
                    tokio::spawn(async move { supervisor.handle_event(event).await });
                }
                _ = scan.tick() => {
                    let supervisor = self.clone();
                    tokio::spawn(async move { supervisor.tick_scan().await });
                }
                _ = availability.tick() => {
                    let supervisor = self.clone();
                    tokio::spawn(async move { supervisor.tick_availability().await });
                }
                _ = battery.tick() => {
                    let supervisor = self.clone();
                    tokio::spawn(async move { supervisor.tick_battery().await });
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        info!("Supervisor stopped");
    }
}

/// Handle to the running supervisor loop.
pub struct SupervisorTask {
    supervisor: Supervisor,
    background_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl SupervisorTask {
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Stop the loop, waiting up to 5 seconds, then tear down every
    /// subscription.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }

        if let Some(task) = self.background_task.take() {
            match timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(SupervisorError::ShutdownError(format!(
                        "Supervisor task panicked: {e}"
                    )))
                }
                Err(_) => {
                    return Err(SupervisorError::ShutdownError(
                        "Supervisor task shutdown timed out after 5 seconds".to_string(),
                    ))
                }
            }
        }

        self.supervisor.unsubscribe_all().await;
        Ok(())
    }
}
