//! Configuration types for the supervisor
//!
//! Timer intervals, subscription leases and resubscription backoff.

use std::time::Duration;

use crate::error::SupervisorError;
use crate::types::ServiceChannel;

/// Interval of the fallback polling tick
pub const SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// Interval of the availability check
pub const AVAILABILITY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// A device with no activity for this long is checked and may be taken offline
pub const AVAILABILITY_TIMEOUT: Duration = Duration::from_millis(60_000 * 9 / 2);

/// Interval of the battery scan for portable speakers
pub const BATTERY_SCAN_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Lease requested when subscribing
pub const SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(1200);

/// Configuration for the [`Supervisor`](crate::Supervisor)
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Fallback polling tick. Subscriptions that have not delivered a first
    /// event within one interval are considered broken.
    /// Default: 10 seconds
    pub scan_interval: Duration,

    /// How often mains devices are checked for liveness
    /// Default: 60 seconds
    pub availability_check_interval: Duration,

    /// No activity for this long triggers a check
    /// Default: 4.5 x availability_check_interval
    pub availability_timeout: Duration,

    /// How often battery devices are scanned
    /// Default: 15 minutes
    pub battery_scan_interval: Duration,

    /// Lease requested from the device for each subscription
    /// Default: 1200 seconds
    pub subscription_timeout: Duration,

    /// Renew subscriptions this long before they expire
    /// Default: 120 seconds
    pub renewal_threshold: Duration,

    /// Upper bound for any single network call to a device
    /// Default: 10 seconds
    pub subscribe_timeout: Duration,

    /// First cooldown after a failed subscription attempt
    /// Default: 10 seconds
    pub resub_cooldown_base: Duration,

    /// Cooldown cap for repeated failures
    /// Default: 10 minutes
    pub resub_cooldown_max: Duration,

    /// Quiet period before a regroup reads the topology
    /// Default: 100 milliseconds
    pub regroup_debounce: Duration,

    /// Capacity of the device event channel
    /// Default: 256
    pub event_buffer_size: usize,

    /// Channels subscribed on every device
    /// Default: all channels
    pub channels: Vec<ServiceChannel>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            scan_interval: SCAN_INTERVAL,
            availability_check_interval: AVAILABILITY_CHECK_INTERVAL,
            availability_timeout: AVAILABILITY_TIMEOUT,
            battery_scan_interval: BATTERY_SCAN_INTERVAL,
            subscription_timeout: SUBSCRIPTION_TIMEOUT,
            renewal_threshold: Duration::from_secs(120),
            subscribe_timeout: Duration::from_secs(10),
            resub_cooldown_base: Duration::from_secs(10),
            resub_cooldown_max: Duration::from_secs(600),
            regroup_debounce: Duration::from_millis(100),
            event_buffer_size: 256,
            channels: ServiceChannel::ALL.to_vec(),
        }
    }
}

impl SupervisorConfig {
    /// Create a new SupervisorConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Short intervals, for test rigs and simulations
    pub fn fast_polling() -> Self {
        Self {
            scan_interval: Duration::from_secs(2),
            subscribe_timeout: Duration::from_secs(2),
            resub_cooldown_base: Duration::from_secs(2),
            resub_cooldown_max: Duration::from_secs(30),
            regroup_debounce: Duration::from_millis(20),
            ..Default::default()
        }
        .with_availability_check_interval(Duration::from_secs(10))
    }

    /// Households with many portable speakers: scan batteries more often
    pub fn battery_friendly() -> Self {
        Self {
            battery_scan_interval: Duration::from_secs(5 * 60),
            ..Default::default()
        }
    }

    /// Liveness window for battery-class devices
    pub fn battery_availability_timeout(&self) -> Duration {
        self.battery_scan_interval + self.availability_timeout
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let non_zero = [
            ("scan interval", self.scan_interval),
            ("availability check interval", self.availability_check_interval),
            ("battery scan interval", self.battery_scan_interval),
            ("subscription timeout", self.subscription_timeout),
            ("subscribe timeout", self.subscribe_timeout),
            ("resubscription cooldown", self.resub_cooldown_base),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(SupervisorError::Configuration(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.availability_timeout <= self.availability_check_interval {
            return Err(SupervisorError::Configuration(
                "Availability timeout must exceed the check interval".to_string(),
            ));
        }

        if self.renewal_threshold >= self.subscription_timeout {
            return Err(SupervisorError::Configuration(
                "Renewal threshold must be shorter than the subscription timeout".to_string(),
            ));
        }

        if self.resub_cooldown_base > self.resub_cooldown_max {
            return Err(SupervisorError::Configuration(
                "Invalid cooldown: base must not exceed max".to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(SupervisorError::Configuration(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.channels.is_empty() {
            return Err(SupervisorError::Configuration(
                "At least one channel must be subscribed".to_string(),
            ));
        }

        Ok(())
    }

    // Builder pattern methods for fluent configuration

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Sets the check interval and derives the timeout from it
    pub fn with_availability_check_interval(mut self, interval: Duration) -> Self {
        self.availability_check_interval = interval;
        self.availability_timeout = interval.mul_f64(4.5);
        self
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    pub fn with_cooldown(mut self, base: Duration, max: Duration) -> Self {
        self.resub_cooldown_base = base;
        self.resub_cooldown_max = max;
        self
    }

    pub fn with_regroup_debounce(mut self, debounce: Duration) -> Self {
        self.regroup_debounce = debounce;
        self
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = ServiceChannel>) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }
}
