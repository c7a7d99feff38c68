//! Polling fallback and liveness checks
//!
//! A device is either `Subscribed` (state arrives as push events) or
//! `Polling` (state is pulled on every scan tick). Subscriptions that never
//! deliver a first event, or fail to renew, cut the device over to polling.
//! Devices that stop answering altogether are taken offline.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::activity::{SOURCE_AVAILABILITY_CHECK, SOURCE_BATTERY_POLL, SOURCE_FALLBACK_POLL};
use crate::client::DeviceSnapshot;
use crate::config::SupervisorConfig;
use crate::device::{DeviceContext, DeviceState};
use crate::error::{ClientError, SupervisorError};
use crate::types::{LivenessClass, Reachability};

/// How a device currently receives state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollMode {
    Subscribed,
    Polling,
}

/// What a tick did for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Subscriptions are healthy; this many were renewed
    Subscribed { renewed: usize },
    /// Subscriptions were dropped in favour of polling
    CutOver,
    /// State was pulled successfully
    Polled,
    /// The poll failed; the device keeps its reachability until the
    /// availability check decides otherwise
    PollFailed,
    /// Seen recently enough, no check needed
    Alive,
    /// Idle too long but answered the check
    Checked,
    /// The device was marked unavailable
    WentOffline,
    /// Battery state was refreshed
    BatteryReported,
    /// Nothing to do for this device on this tick
    Skipped,
}

/// Drives the polling side of each device.
#[derive(Debug, Clone)]
pub struct PollingFallback {
    /// Subscriptions must deliver a first event within this window
    silence_window: Duration,
    renewal_threshold: Duration,
    query_timeout: Duration,
    availability_timeout: Duration,
    battery_availability_timeout: Duration,
}

impl PollingFallback {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            silence_window: config.scan_interval,
            renewal_threshold: config.renewal_threshold,
            query_timeout: config.subscribe_timeout,
            availability_timeout: config.availability_timeout,
            battery_availability_timeout: config.battery_availability_timeout(),
        }
    }

    pub fn mode(ctx: &DeviceContext<'_>) -> PollMode {
        if ctx.subscriptions.is_subscribed(&ctx.device.id) {
            PollMode::Subscribed
        } else {
            PollMode::Polling
        }
    }

    /// Scan tick: renew or verify subscriptions, or poll when there are none.
    pub async fn tick(&self, ctx: &DeviceContext<'_>, state: &mut DeviceState) -> TickOutcome {
        let device = ctx.device;

        let Some(set) = ctx.subscriptions.get(&device.id) else {
            return match self.query(ctx).await {
                Ok(snapshot) => {
                    state.last_snapshot = Some(snapshot);
                    ctx.scheduler
                        .on_activity(ctx, state, SOURCE_FALLBACK_POLL)
                        .await;
                    TickOutcome::Polled
                }
                Err(e) => {
                    debug!("Fallback poll of {} failed: {}", device.zone_name, e);
                    TickOutcome::PollFailed
                }
            };
        };

        if set.is_silent(self.silence_window, Instant::now()) {
            return match self.query(ctx).await {
                Ok(snapshot) => {
                    state.last_snapshot = Some(snapshot);
                    ctx.scheduler
                        .on_activity(ctx, state, SOURCE_FALLBACK_POLL)
                        .await;
                    ctx.subscriptions
                        .unsubscribe_all(device, ctx.client)
                        .await;
                    ctx.scheduler.fail(
                        ctx,
                        state,
                        SOURCE_FALLBACK_POLL,
                        &format!("no events received within {:?}", self.silence_window),
                    );
                    TickOutcome::CutOver
                }
                Err(e) => {
                    self.go_offline(ctx, state, &e);
                    TickOutcome::WentOffline
                }
            };
        }

        match ctx
            .subscriptions
            .renew_expiring(device, ctx.client, self.renewal_threshold)
            .await
        {
            Ok(renewed) => TickOutcome::Subscribed { renewed },
            Err(e) => {
                ctx.scheduler.fail(ctx, state, "renewal", &e);
                TickOutcome::CutOver
            }
        }
    }

    /// Availability tick: check mains devices that have been idle too long.
    pub async fn check_availability(
        &self,
        ctx: &DeviceContext<'_>,
        state: &mut DeviceState,
    ) -> TickOutcome {
        let device = ctx.device;
        if device.liveness == LivenessClass::Battery
            || state.reachability == Reachability::Unavailable
        {
            return TickOutcome::Skipped;
        }

        if ctx
            .tracker
            .is_alive(&device.id, self.availability_timeout, Instant::now())
        {
            return TickOutcome::Alive;
        }

        match self.query(ctx).await {
            Ok(snapshot) => {
                state.last_snapshot = Some(snapshot);
                ctx.scheduler
                    .on_activity(ctx, state, SOURCE_AVAILABILITY_CHECK)
                    .await;
                TickOutcome::Checked
            }
            Err(e) => {
                self.go_offline(ctx, state, &e);
                TickOutcome::WentOffline
            }
        }
    }

    /// Battery tick: refresh battery state and check the longer liveness
    /// window of portable speakers.
    pub async fn scan_battery(
        &self,
        ctx: &DeviceContext<'_>,
        state: &mut DeviceState,
    ) -> TickOutcome {
        let device = ctx.device;
        if device.liveness != LivenessClass::Battery {
            return TickOutcome::Skipped;
        }

        match self.bounded(ctx.client.query_battery()).await {
            Ok(Some(battery)) => {
                debug!(
                    "{} battery at {}% ({})",
                    device.zone_name, battery.level, battery.power_source
                );
                state.battery = Some(battery);
                ctx.scheduler
                    .on_activity(ctx, state, SOURCE_BATTERY_POLL)
                    .await;
                TickOutcome::BatteryReported
            }
            Ok(None) => TickOutcome::Skipped,
            Err(e) => {
                debug!("Battery scan of {} failed: {}", device.zone_name, e);
                let alive = ctx.tracker.is_alive(
                    &device.id,
                    self.battery_availability_timeout,
                    Instant::now(),
                );
                if !alive && state.reachability == Reachability::Available {
                    self.go_offline(ctx, state, &e);
                    TickOutcome::WentOffline
                } else {
                    TickOutcome::PollFailed
                }
            }
        }
    }

    /// Mark the device unavailable and drop its subscriptions.
    ///
    /// The remote side is not contacted since it just failed to answer. The
    /// cooldown is cleared so the first sign of life resubscribes at once.
    pub fn go_offline(
        &self,
        ctx: &DeviceContext<'_>,
        state: &mut DeviceState,
        reason: &dyn Display,
    ) {
        let device = ctx.device;
        ctx.subscriptions.forget(&device.id);
        state.subscriptions_failed = true;
        state.cooldown.reset();

        if state.reachability == Reachability::Available {
            state.reachability = Reachability::Unavailable;
            warn!("{} is unreachable, marking unavailable: {}", device.zone_name, reason);
            ctx.registry.write_state(&device.id);
        }
    }

    /// Pull device state, bounded by the query timeout
    pub async fn query(&self, ctx: &DeviceContext<'_>) -> Result<DeviceSnapshot, SupervisorError> {
        self.bounded(ctx.client.query_state())
            .await
            .map_err(|e| SupervisorError::DeviceUnreachable {
                speaker_id: ctx.device.id.clone(),
                reason: e.to_string(),
            })
    }

    async fn bounded<T>(
        &self,
        request: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        match tokio::time::timeout(self.query_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(self.query_timeout)),
        }
    }
}
