//! Error types for the sonos-supervisor crate.

use std::time::Duration;

use crate::types::{ServiceChannel, SpeakerId};

/// Errors returned by a [`DeviceClient`](crate::client::DeviceClient) implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The device did not answer within the allotted time
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure (refused, reset, unreachable host)
    #[error("Connection error: {0}")]
    Connection(String),

    /// The device answered but refused the request
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Errors from subscription operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriptionError {
    /// A subscription could not be created, either because the device
    /// refused the connection or because it did not answer in time
    #[error("Failed to create {channel} subscription: {reason}")]
    CreationFailed {
        channel: ServiceChannel,
        reason: String,
    },

    /// An existing subscription could not be renewed
    #[error("Failed to renew {channel} subscription: {reason}")]
    RenewalFailed {
        channel: ServiceChannel,
        reason: String,
    },

    /// Remote teardown failed. Only ever logged.
    #[error("Failed to tear down {channel} subscription: {reason}")]
    TeardownFailed {
        channel: ServiceChannel,
        reason: String,
    },
}

impl SubscriptionError {
    /// The channel the failing operation targeted
    pub fn channel(&self) -> ServiceChannel {
        match self {
            SubscriptionError::CreationFailed { channel, .. }
            | SubscriptionError::RenewalFailed { channel, .. }
            | SubscriptionError::TeardownFailed { channel, .. } => *channel,
        }
    }
}

/// Errors that can occur in the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Subscription setup or renewal failed
    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// The device did not answer a direct query
    #[error("Device {speaker_id} unreachable: {reason}")]
    DeviceUnreachable { speaker_id: SpeakerId, reason: String },

    /// No device with this id is supervised
    #[error("Device not found: {0}")]
    DeviceNotFound(SpeakerId),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The background loop was already started
    #[error("Supervisor is already running")]
    AlreadyRunning,

    /// An error occurred during shutdown
    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    /// A spawned background task panicked
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

/// Convenience type alias for Results using SupervisorError.
pub type Result<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_display() {
        let error = ClientError::Timeout(Duration::from_secs(10));
        assert_eq!(error.to_string(), "Request timed out after 10s");

        let error = ClientError::Connection("Took too long".to_string());
        assert_eq!(error.to_string(), "Connection error: Took too long");
    }

    #[test]
    fn test_subscription_error_display() {
        let error = SubscriptionError::CreationFailed {
            channel: ServiceChannel::AVTransport,
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Failed to create AVTransport subscription: connection refused"
        );
        assert_eq!(error.channel(), ServiceChannel::AVTransport);

        let error = SubscriptionError::TeardownFailed {
            channel: ServiceChannel::AlarmClock,
            reason: "412".to_string(),
        };
        assert!(error.to_string().contains("tear down AlarmClock"));
    }

    #[test]
    fn test_supervisor_error_display() {
        let error = SupervisorError::DeviceUnreachable {
            speaker_id: SpeakerId::new("RINCON_1"),
            reason: "timeout".to_string(),
        };
        assert_eq!(error.to_string(), "Device RINCON_1 unreachable: timeout");

        let error = SupervisorError::DeviceNotFound(SpeakerId::new("RINCON_9"));
        assert_eq!(error.to_string(), "Device not found: RINCON_9");
    }

    #[test]
    fn test_error_conversion_from_subscription_error() {
        let error: SupervisorError = SubscriptionError::RenewalFailed {
            channel: ServiceChannel::RenderingControl,
            reason: "gone".to_string(),
        }
        .into();

        match error {
            SupervisorError::Subscription(e) => {
                assert_eq!(e.channel(), ServiceChannel::RenderingControl);
            }
            _ => panic!("Expected Subscription variant"),
        }
    }
}
