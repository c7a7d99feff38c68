//! Cooldown-gated resubscription
//!
//! A device whose subscriptions failed stays on polling until some activity
//! shows it is reachable again. Each failed attempt pushes the next one out
//! with a bounded exponential backoff.

use std::fmt::Display;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::device::{DeviceContext, DeviceState};
use crate::types::Reachability;

/// When the next subscription attempt is allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CooldownState {
    allowed_after: Option<Instant>,
    failures: u32,
}

impl CooldownState {
    /// Time left before an attempt is allowed, `None` if allowed now
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.allowed_after
            .filter(|deadline| *deadline > now)
            .map(|deadline| deadline - now)
    }

    pub fn allowed_after(&self) -> Option<Instant> {
        self.allowed_after
    }

    /// Consecutive failed attempts since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Count a failed attempt and push the deadline out. Returns the wait.
    pub fn record_failure(&mut self, now: Instant, base: Duration, max: Duration) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let wait = backoff(self.failures, base, max);
        self.allowed_after = Some(now + wait);
        wait
    }

    pub fn reset(&mut self) {
        self.allowed_after = None;
        self.failures = 0;
    }
}

/// Wait after the given number of consecutive failures: `base`, doubling,
/// never above `max`.
pub fn backoff(failures: u32, base: Duration, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1 << exponent).min(max)
}

/// Result of feeding activity to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityOutcome {
    /// Activity recorded, nothing else to do
    Recorded,
    /// The device was unavailable and is now back
    BecameAvailable,
    /// Subscriptions are failed but the cooldown has not expired
    CoolingDown(Duration),
    /// A new subscription set with this many channels is in place
    Resubscribed(usize),
    /// The attempt failed; the next one waits this long
    ResubscribeFailed(Duration),
}

/// Decides when a device gets another subscription attempt.
#[derive(Debug, Clone)]
pub struct ResubscriptionScheduler {
    cooldown_base: Duration,
    cooldown_max: Duration,
}

impl ResubscriptionScheduler {
    pub fn new(cooldown_base: Duration, cooldown_max: Duration) -> Self {
        Self {
            cooldown_base,
            cooldown_max,
        }
    }

    /// Record activity and resubscribe if the device needs it.
    ///
    /// Callers hold the device mutex, so at most one attempt per device is
    /// ever in flight.
    pub async fn on_activity(
        &self,
        ctx: &DeviceContext<'_>,
        state: &mut DeviceState,
        source: &str,
    ) -> ActivityOutcome {
        let now = Instant::now();
        let device = ctx.device;
        ctx.tracker.record(&device.id, source, now);
        debug!("Activity on {} from {}", device.zone_name, source);

        let came_back = state.reachability == Reachability::Unavailable;
        if came_back {
            state.reachability = Reachability::Available;
            info!("{} is reachable again", device.zone_name);
            ctx.registry.write_state(&device.id);
        }

        if !state.subscriptions_failed {
            return if came_back {
                ActivityOutcome::BecameAvailable
            } else {
                ActivityOutcome::Recorded
            };
        }

        if let Some(remaining) = state.cooldown.remaining(now) {
            debug!(
                "Not resubscribing to {} yet, cooldown ends in {:?}",
                device.zone_name, remaining
            );
            return ActivityOutcome::CoolingDown(remaining);
        }

        self.subscribe(ctx, state, source).await
    }

    /// Attempt a full subscription set now, ignoring the cooldown.
    pub async fn subscribe(
        &self,
        ctx: &DeviceContext<'_>,
        state: &mut DeviceState,
        source: &str,
    ) -> ActivityOutcome {
        let device = ctx.device;
        match ctx.subscriptions.subscribe(device, ctx.client).await {
            Ok(set) => {
                let was_failed = state.subscriptions_failed;
                state.subscriptions_failed = false;
                state.cooldown.reset();
                ctx.repairs.mark_healthy(&device.id, ctx.registry);
                if was_failed {
                    info!(
                        "Resubscribed to {} after activity from {}",
                        device.zone_name, source
                    );
                }
                ActivityOutcome::Resubscribed(set.len())
            }
            Err(error) => ActivityOutcome::ResubscribeFailed(self.fail(ctx, state, source, &error)),
        }
    }

    /// Put the device on polling fallback and start a cooldown.
    ///
    /// The device's subscriptions must already be gone. Returns the wait
    /// before the next attempt.
    pub fn fail(
        &self,
        ctx: &DeviceContext<'_>,
        state: &mut DeviceState,
        source: &str,
        reason: &dyn Display,
    ) -> Duration {
        let device = ctx.device;
        state.subscriptions_failed = true;
        let wait = state
            .cooldown
            .record_failure(Instant::now(), self.cooldown_base, self.cooldown_max);
        warn!(
            "Subscriptions to {} failed ({}), falling back to polling: {}. \
             Next attempt after activity in {:?}",
            device.zone_name, source, reason, wait
        );
        ctx.repairs.mark_failing(&device.id, &device.zone_name, ctx.registry);
        wait
    }
}
