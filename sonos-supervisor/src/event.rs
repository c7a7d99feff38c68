//! Typed events flowing from device clients into the supervisor.

use crate::client::TopologySnapshot;
use crate::types::{ServiceChannel, SpeakerId};

/// Something observed about a device outside of supervisor-initiated calls.
///
/// Callback servers, SSDP listeners and client implementations push these
/// onto the channel returned by [`Supervisor::event_sender`](crate::Supervisor::event_sender).
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A push notification arrived on a subscribed channel
    Notification {
        speaker_id: SpeakerId,
        channel: ServiceChannel,
    },

    /// Grouping changed. The payload is the topology carried by the event, if
    /// the sender already parsed it.
    TopologyChanged {
        speaker_id: SpeakerId,
        topology: Option<TopologySnapshot>,
    },

    /// The device answered a discovery broadcast
    Discovered { speaker_id: SpeakerId },

    /// The device restarted and lost every subscription it held
    Rebooted { speaker_id: SpeakerId },

    /// The device left the household for good
    Vanished { speaker_id: SpeakerId, reason: String },
}

impl DeviceEvent {
    /// The device this event concerns
    pub fn speaker_id(&self) -> &SpeakerId {
        match self {
            DeviceEvent::Notification { speaker_id, .. }
            | DeviceEvent::TopologyChanged { speaker_id, .. }
            | DeviceEvent::Discovered { speaker_id }
            | DeviceEvent::Rebooted { speaker_id }
            | DeviceEvent::Vanished { speaker_id, .. } => speaker_id,
        }
    }

    /// Activity source tag recorded when this event is handled
    pub fn source_tag(&self) -> String {
        match self {
            DeviceEvent::Notification { channel, .. } => format!("{channel} subscription"),
            DeviceEvent::TopologyChanged { .. } => {
                format!("{} subscription", ServiceChannel::ZoneGroupTopology)
            }
            DeviceEvent::Discovered { .. } => "discovery".to_string(),
            DeviceEvent::Rebooted { .. } => "reboot".to_string(),
            DeviceEvent::Vanished { .. } => "vanished".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_tags() {
        let event = DeviceEvent::Notification {
            speaker_id: SpeakerId::new("RINCON_1"),
            channel: ServiceChannel::RenderingControl,
        };
        assert_eq!(event.source_tag(), "RenderingControl subscription");
        assert_eq!(event.speaker_id().as_str(), "RINCON_1");

        let event = DeviceEvent::Discovered {
            speaker_id: SpeakerId::new("RINCON_1"),
        };
        assert_eq!(event.source_tag(), "discovery");
    }
}
