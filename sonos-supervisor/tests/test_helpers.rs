//! Shared helpers for supervisor integration tests.
//!
//! - A registry that records every write and issue
//! - A log capture writer for asserting on diagnostics
//! - Device and topology builders
#![allow(dead_code)]

use sonos_supervisor::{
    Device, EntityRegistry, LivenessClass, RepairIssue, SpeakerId, ZoneGroup, ZoneMember,
};
use std::io;
use std::sync::{Arc, Mutex};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

/// Registry that records everything it is told.
#[derive(Default)]
pub struct RecordingRegistry {
    writes: Mutex<Vec<SpeakerId>>,
    raised: Mutex<Vec<RepairIssue>>,
    cleared: Mutex<Vec<String>>,
}

impl RecordingRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> Vec<SpeakerId> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_for(&self, speaker_id: &SpeakerId) -> usize {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == speaker_id)
            .count()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    pub fn raised(&self) -> Vec<RepairIssue> {
        self.raised.lock().unwrap().clone()
    }

    pub fn cleared(&self) -> Vec<String> {
        self.cleared.lock().unwrap().clone()
    }
}

impl EntityRegistry for RecordingRegistry {
    fn write_state(&self, entity_id: &SpeakerId) {
        self.writes.lock().unwrap().push(entity_id.clone());
    }

    fn raise_issue(&self, issue: RepairIssue) {
        self.raised.lock().unwrap().push(issue);
    }

    fn clear_issue(&self, issue_id: &str) {
        self.cleared.lock().unwrap().push(issue_id.to_string());
    }
}

/// Captures formatted log output in memory.
///
/// The subscriber is installed for the current thread only, which covers
/// every task on the current-thread runtime used by `#[tokio::test]`.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .without_time()
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.contents().contains(needle)
    }

    /// Byte offset of the first occurrence, for ordering assertions
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.contents().find(needle)
    }
}

pub struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            buffer: self.buffer.clone(),
        }
    }
}

pub fn create_test_device(id: &str, zone_name: &str, ip: &str) -> Device {
    Device::new(id, zone_name, ip.parse().unwrap()).with_model("One")
}

pub fn create_battery_device(id: &str, zone_name: &str, ip: &str) -> Device {
    Device::new(id, zone_name, ip.parse().unwrap())
        .with_model("Roam")
        .with_liveness(LivenessClass::Battery)
}

/// One zone group, members given as (id, zone name)
pub fn zone_group(coordinator: Option<&str>, members: &[(&str, &str)]) -> ZoneGroup {
    ZoneGroup {
        id: format!("{}:0", members.first().map_or("empty", |(id, _)| *id)),
        coordinator: coordinator.map(SpeakerId::new),
        members: members
            .iter()
            .map(|(id, zone_name)| ZoneMember::new(*id, *zone_name))
            .collect(),
    }
}
