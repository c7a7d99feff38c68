//! Simulated household
//!
//! Runs the supervisor against in-process fake speakers. One of them sits
//! behind a firewall that drops every event, so it falls back to polling
//! after the first scan tick. The other groups with it halfway through.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use sonos_supervisor::logging::{init_logging, LoggingMode};
use sonos_supervisor::prelude::*;
use sonos_supervisor::{
    ClientError, DeviceSnapshot, SubscriptionGrant, TopologySnapshot, ZoneGroup, ZoneMember,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Sonos Supervisor Simulation
///
/// Demonstrates polling fallback and regrouping without real hardware.
#[derive(Parser, Debug)]
#[command(name = "simulated-household")]
#[command(about = "Run the subscription supervisor against fake speakers")]
struct Args {
    /// How long to run, in seconds
    #[arg(short, long, default_value = "12")]
    duration: u64,

    /// Logging mode (silent, development, debug, json)
    #[arg(long, default_value = "development")]
    log_mode: String,

    /// Print the final diagnostics as JSON
    #[arg(long)]
    diagnostics: bool,
}

const LIVING_ROOM: &str = "RINCON_SIMLIVING01400";
const STUDY: &str = "RINCON_SIMSTUDY001400";

struct FakeSpeaker {
    next_sid: AtomicU32,
}

impl FakeSpeaker {
    fn new() -> Self {
        Self {
            next_sid: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl DeviceClient for FakeSpeaker {
    async fn subscribe(
        &self,
        channel: ServiceChannel,
        requested_timeout: Duration,
    ) -> Result<SubscriptionGrant, ClientError> {
        let n = self.next_sid.fetch_add(1, Ordering::Relaxed);
        Ok(SubscriptionGrant::new(
            format!("uuid:sim-{channel}-{n}"),
            requested_timeout,
        ))
    }

    async fn renew(
        &self,
        _sid: &str,
        requested_timeout: Duration,
    ) -> Result<Duration, ClientError> {
        Ok(requested_timeout)
    }

    async fn unsubscribe(&self, _sid: &str) -> Result<(), ClientError> {
        Ok(())
    }

    async fn query_state(&self) -> Result<DeviceSnapshot, ClientError> {
        Ok(DeviceSnapshot {
            volume: Some(30),
            muted: Some(false),
            transport_state: Some("PLAYING".to_string()),
            current_track_uri: None,
        })
    }

    async fn query_topology(&self) -> Result<TopologySnapshot, ClientError> {
        Ok(household_grouped())
    }
}

/// No-op registry that logs what it is told
struct LoggingRegistry;

impl EntityRegistry for LoggingRegistry {
    fn write_state(&self, entity_id: &SpeakerId) {
        info!("write_state({entity_id})");
    }

    fn raise_issue(&self, issue: RepairIssue) {
        info!("Repair issue raised: {} ({})", issue.message, issue.learn_more_url);
    }

    fn clear_issue(&self, issue_id: &str) {
        info!("Repair issue cleared: {issue_id}");
    }
}

fn household_grouped() -> TopologySnapshot {
    vec![ZoneGroup {
        id: format!("{LIVING_ROOM}:1"),
        coordinator: Some(SpeakerId::new(LIVING_ROOM)),
        members: vec![
            ZoneMember::new(LIVING_ROOM, "Living Room"),
            ZoneMember::new(STUDY, "Study"),
        ],
    }]
}

/// True once a run of `total` has reached its midpoint
fn past_halfway(elapsed: Duration, total: Duration) -> bool {
    elapsed >= total / 2
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mode: LoggingMode = args.log_mode.parse().context("Invalid --log-mode")?;
    init_logging(mode).context("Failed to initialize logging")?;

    let config = SupervisorConfig::fast_polling();
    let supervisor = Supervisor::new(config, Arc::new(LoggingRegistry))?;

    let living_room = Device::new(LIVING_ROOM, "Living Room", "192.168.1.50".parse()?)
        .with_model("Five");
    let study = Device::new(STUDY, "Study", "192.168.1.51".parse()?).with_model("Era 100");
    supervisor
        .add_device(living_room, Arc::new(FakeSpeaker::new()))
        .await?;
    supervisor.add_device(study, Arc::new(FakeSpeaker::new())).await?;

    let task = supervisor.start()?;
    let events = supervisor.event_sender();

    // Living Room's events get through; the Study's never do.
    let total = Duration::from_secs(args.duration);
    let step = Duration::from_secs(1);
    let mut elapsed = Duration::ZERO;
    let mut regrouped = false;
    while elapsed < total {
        events
            .send(DeviceEvent::Notification {
                speaker_id: SpeakerId::new(LIVING_ROOM),
                channel: ServiceChannel::AVTransport,
            })
            .await?;

        if !regrouped && past_halfway(elapsed, total) {
            regrouped = true;
            events
                .send(DeviceEvent::TopologyChanged {
                    speaker_id: SpeakerId::new(LIVING_ROOM),
                    topology: None,
                })
                .await?;
        }

        tokio::time::sleep(step).await;
        elapsed += step;
    }

    for device in supervisor.devices() {
        info!(
            "{}: mode={:?} coordinator={:?}",
            device.zone_name,
            supervisor.mode(&device.id)?,
            supervisor.coordinator_of(&device.id)
        );
    }

    if args.diagnostics {
        let report = supervisor.diagnostics().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    task.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regroup_fires_for_odd_durations() {
        for secs in [2, 7, 12, 13] {
            let total = Duration::from_secs(secs);
            let fired = (0..secs)
                .map(Duration::from_secs)
                .filter(|elapsed| past_halfway(*elapsed, total))
                .count();
            assert!(fired > 0, "no regroup within a {secs}s run");
        }
    }
}
