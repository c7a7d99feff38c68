//! Group topology resolution
//!
//! Turns a household topology report into one [`GroupSnapshot`] per group of
//! known devices and tracks which devices changed since the last cycle, so
//! each changed entity is written exactly once.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::{AbortHandle, JoinHandle};

use crate::client::ZoneGroup;
use crate::error::{Result, SupervisorError};
use crate::types::SpeakerId;

/// An ordered group of devices. The first member is the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSnapshot {
    members: Vec<SpeakerId>,
}

impl GroupSnapshot {
    /// A device grouped with nobody but itself
    pub fn standalone(speaker_id: SpeakerId) -> Self {
        Self {
            members: vec![speaker_id],
        }
    }

    /// Build a snapshot with `coordinator` first and the rest sorted by id
    pub fn new(coordinator: SpeakerId, others: impl IntoIterator<Item = SpeakerId>) -> Self {
        let mut rest: Vec<SpeakerId> = others
            .into_iter()
            .filter(|id| *id != coordinator)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut members = Vec::with_capacity(rest.len() + 1);
        members.push(coordinator);
        members.append(&mut rest);
        Self { members }
    }

    pub fn coordinator(&self) -> &SpeakerId {
        &self.members[0]
    }

    pub fn members(&self) -> &[SpeakerId] {
        &self.members
    }

    pub fn contains(&self, speaker_id: &SpeakerId) -> bool {
        self.members.contains(speaker_id)
    }

    pub fn is_standalone(&self) -> bool {
        self.members.len() == 1
    }

    /// Coordinator of `speaker_id`, `None` when it coordinates itself
    pub fn coordinator_for(&self, speaker_id: &SpeakerId) -> Option<&SpeakerId> {
        let coordinator = self.coordinator();
        (coordinator != speaker_id && self.contains(speaker_id)).then_some(coordinator)
    }

    /// The same group without `speaker_id`, `None` if nobody is left
    fn without(&self, speaker_id: &SpeakerId) -> Option<Self> {
        let remaining: Vec<SpeakerId> = self
            .members
            .iter()
            .filter(|id| *id != speaker_id)
            .cloned()
            .collect();
        let coordinator = if self.coordinator() == speaker_id {
            remaining.iter().min()?.clone()
        } else {
            self.coordinator().clone()
        };
        Some(Self::new(coordinator, remaining))
    }
}

/// Resolve a topology report against the set of known devices.
///
/// Invisible members and unknown devices are dropped. A device listed in
/// more than one group stays in the first. The reported coordinator wins when
/// it is a known member, otherwise the lowest id does. Known devices missing
/// from the report come back standalone. Output is sorted by coordinator.
pub fn resolve_groups(topology: &[ZoneGroup], known: &BTreeSet<SpeakerId>) -> Vec<GroupSnapshot> {
    let mut placed: BTreeSet<SpeakerId> = BTreeSet::new();
    let mut groups = Vec::new();

    for group in topology {
        let members: BTreeSet<SpeakerId> = group
            .members
            .iter()
            .filter(|member| !member.invisible)
            .map(|member| member.id.clone())
            .filter(|id| known.contains(id) && !placed.contains(id))
            .collect();

        let coordinator = match &group.coordinator {
            Some(flagged) if members.contains(flagged) => flagged.clone(),
            _ => match members.iter().next() {
                Some(lowest) => lowest.clone(),
                None => continue,
            },
        };

        placed.extend(members.iter().cloned());
        groups.push(GroupSnapshot::new(coordinator, members));
    }

    for id in known {
        if !placed.contains(id) {
            groups.push(GroupSnapshot::standalone(id.clone()));
        }
    }

    groups.sort_by(|a, b| a.coordinator().cmp(b.coordinator()));
    groups
}

/// Devices and groups that changed in one regroup cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegroupChanges {
    /// Every device whose group changed, each listed once
    pub changed_devices: BTreeSet<SpeakerId>,
    /// The new snapshots of groups with at least one changed member
    pub changed_groups: Vec<GroupSnapshot>,
}

impl RegroupChanges {
    pub fn is_empty(&self) -> bool {
        self.changed_devices.is_empty()
    }
}

/// How a regroup ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegroupOutcome {
    Applied(RegroupChanges),
    Unchanged,
    /// A newer regroup for the same seed took over
    Superseded,
}

struct PendingRegroup {
    generation: u64,
    abort: Option<AbortHandle>,
}

/// Current groups plus the bookkeeping that keeps stale regroups out.
#[derive(Default)]
pub struct GroupTopologyCoordinator {
    groups: Mutex<HashMap<SpeakerId, GroupSnapshot>>,
    pending: Mutex<HashMap<SpeakerId, PendingRegroup>>,
    generations: AtomicU64,
}

impl GroupTopologyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new device as its own group
    pub fn insert_standalone(&self, speaker_id: &SpeakerId) {
        self.groups
            .lock()
            .entry(speaker_id.clone())
            .or_insert_with(|| GroupSnapshot::standalone(speaker_id.clone()));
    }

    pub fn group_of(&self, speaker_id: &SpeakerId) -> Option<GroupSnapshot> {
        self.groups.lock().get(speaker_id).cloned()
    }

    /// Start a regroup for `seed`, superseding any regroup still in flight
    /// for it. Returns the generation the new regroup must present to apply.
    pub fn begin(&self, seed: &SpeakerId) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.pending.lock().insert(
            seed.clone(),
            PendingRegroup {
                generation,
                abort: None,
            },
        );
        if let Some(abort) = previous.and_then(|pending| pending.abort) {
            abort.abort();
        }
        generation
    }

    /// Attach the task running `generation` so a newer regroup can abort it
    pub fn attach(&self, seed: &SpeakerId, generation: u64, abort: AbortHandle) {
        match self.pending.lock().get_mut(seed) {
            Some(pending) if pending.generation == generation => pending.abort = Some(abort),
            // Superseded before it was even attached
            _ => abort.abort(),
        }
    }

    /// Apply a resolved topology if `generation` is still the newest for
    /// `seed`. Returns `None` when it was superseded.
    pub fn apply(
        &self,
        seed: &SpeakerId,
        generation: u64,
        resolved: Vec<GroupSnapshot>,
    ) -> Option<RegroupChanges> {
        let mut pending = self.pending.lock();
        match pending.get(seed) {
            Some(current) if current.generation == generation => {
                pending.remove(seed);
            }
            _ => return None,
        }

        let mut groups = self.groups.lock();
        let mut changes = RegroupChanges::default();
        for snapshot in resolved {
            let mut changed = false;
            for member in snapshot.members() {
                if groups.get(member) != Some(&snapshot) {
                    changes.changed_devices.insert(member.clone());
                    changed = true;
                }
            }
            if changed {
                for member in snapshot.members() {
                    groups.insert(member.clone(), snapshot.clone());
                }
                changes.changed_groups.push(snapshot);
            }
        }
        Some(changes)
    }

    /// Drop the pending entry of a regroup that failed before applying
    pub fn abandon(&self, seed: &SpeakerId, generation: u64) {
        let mut pending = self.pending.lock();
        if pending
            .get(seed)
            .map_or(false, |current| current.generation == generation)
        {
            pending.remove(seed);
        }
    }

    /// Forget a device and shrink the group it was in.
    ///
    /// Returns the former peers whose group changed.
    pub fn remove_device(&self, speaker_id: &SpeakerId) -> Vec<SpeakerId> {
        if let Some(pending) = self.pending.lock().remove(speaker_id) {
            if let Some(abort) = pending.abort {
                abort.abort();
            }
        }

        let mut groups = self.groups.lock();
        let Some(old) = groups.remove(speaker_id) else {
            return Vec::new();
        };
        let Some(shrunk) = old.without(speaker_id) else {
            return Vec::new();
        };
        let peers = shrunk.members().to_vec();
        for peer in &peers {
            groups.insert(peer.clone(), shrunk.clone());
        }
        peers
    }

    /// Number of regroups still in flight
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

/// An in-flight regroup. Await it for the outcome or drop it to let the
/// regroup finish in the background.
pub struct RegroupHandle {
    handle: JoinHandle<Result<RegroupOutcome>>,
    seed: SpeakerId,
    generation: u64,
    coordinator: Arc<GroupTopologyCoordinator>,
}

impl RegroupHandle {
    pub(crate) fn new(
        handle: JoinHandle<Result<RegroupOutcome>>,
        seed: SpeakerId,
        generation: u64,
        coordinator: Arc<GroupTopologyCoordinator>,
    ) -> Self {
        Self {
            handle,
            seed,
            generation,
            coordinator,
        }
    }

    /// Abort the regroup. Awaiting it afterwards yields `Superseded`.
    pub fn cancel(&self) {
        self.handle.abort();
        self.coordinator.abandon(&self.seed, self.generation);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for RegroupHandle {
    type Output = Result<RegroupOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) if e.is_cancelled() => {
                self.coordinator.abandon(&self.seed, self.generation);
                Poll::Ready(Ok(RegroupOutcome::Superseded))
            }
            Poll::Ready(Err(e)) => {
                self.coordinator.abandon(&self.seed, self.generation);
                Poll::Ready(Err(SupervisorError::TaskFailed(e.to_string())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ZoneMember;
    use proptest::prelude::*;

    fn ids(names: &[&str]) -> BTreeSet<SpeakerId> {
        names.iter().map(|name| SpeakerId::new(*name)).collect()
    }

    fn group(coordinator: Option<&str>, members: &[&str]) -> ZoneGroup {
        ZoneGroup {
            id: format!("{}:1", members.first().copied().unwrap_or("empty")),
            coordinator: coordinator.map(SpeakerId::new),
            members: members
                .iter()
                .map(|id| ZoneMember::new(*id, format!("Zone {id}")))
                .collect(),
        }
    }

    fn member_names(snapshot: &GroupSnapshot) -> Vec<&str> {
        snapshot.members().iter().map(SpeakerId::as_str).collect()
    }

    #[test]
    fn test_flagged_coordinator_wins() {
        let topology = vec![group(Some("C"), &["A", "B", "C"])];
        let groups = resolve_groups(&topology, &ids(&["A", "B", "C"]));
        assert_eq!(groups.len(), 1);
        assert_eq!(member_names(&groups[0]), vec!["C", "A", "B"]);
        assert_eq!(
            groups[0]
                .coordinator_for(&SpeakerId::new("A"))
                .map(SpeakerId::as_str),
            Some("C")
        );
        assert_eq!(groups[0].coordinator_for(&SpeakerId::new("C")), None);
    }

    #[test]
    fn test_unknown_coordinator_falls_back_to_lowest_id() {
        let topology = vec![group(Some("Z"), &["B", "A", "Z"])];
        let groups = resolve_groups(&topology, &ids(&["A", "B"]));
        assert_eq!(member_names(&groups[0]), vec!["A", "B"]);
    }

    #[test]
    fn test_invisible_members_and_missing_devices() {
        let mut home_theater = group(Some("A"), &["A"]);
        home_theater
            .members
            .push(ZoneMember::new("SUB", "Living Room").invisible());
        let groups = resolve_groups(&[home_theater], &ids(&["A", "SUB", "D"]));

        let names: Vec<Vec<&str>> = groups.iter().map(member_names).collect();
        assert_eq!(names, vec![vec!["A"], vec!["D"], vec!["SUB"]]);
    }

    #[test]
    fn test_device_in_two_groups_stays_in_first() {
        let topology = vec![group(None, &["A", "B"]), group(Some("B"), &["B", "C"])];
        let groups = resolve_groups(&topology, &ids(&["A", "B", "C"]));
        let names: Vec<Vec<&str>> = groups.iter().map(member_names).collect();
        assert_eq!(names, vec![vec!["A", "B"], vec!["C"]]);
    }

    #[test]
    fn test_apply_reports_changes_once() {
        let coordinator = GroupTopologyCoordinator::new();
        let a = SpeakerId::new("A");
        let b = SpeakerId::new("B");
        coordinator.insert_standalone(&a);
        coordinator.insert_standalone(&b);

        let generation = coordinator.begin(&a);
        let resolved = vec![GroupSnapshot::new(a.clone(), [b.clone()])];
        let changes = coordinator.apply(&a, generation, resolved.clone()).unwrap();
        assert_eq!(changes.changed_devices, ids(&["A", "B"]));
        assert_eq!(changes.changed_groups.len(), 1);

        let generation = coordinator.begin(&b);
        let changes = coordinator.apply(&b, generation, resolved).unwrap();
        assert!(changes.is_empty());
        assert_eq!(coordinator.pending(), 0);
    }

    #[test]
    fn test_standalone_recompute_is_a_no_op() {
        let coordinator = GroupTopologyCoordinator::new();
        let a = SpeakerId::new("A");
        coordinator.insert_standalone(&a);

        let generation = coordinator.begin(&a);
        let changes = coordinator
            .apply(&a, generation, vec![GroupSnapshot::standalone(a.clone())])
            .unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_superseded_generation_is_rejected() {
        let coordinator = GroupTopologyCoordinator::new();
        let a = SpeakerId::new("A");
        coordinator.insert_standalone(&a);

        let old = coordinator.begin(&a);
        let new = coordinator.begin(&a);
        assert!(coordinator
            .apply(&a, old, vec![GroupSnapshot::standalone(a.clone())])
            .is_none());
        assert!(coordinator
            .apply(&a, new, vec![GroupSnapshot::standalone(a.clone())])
            .is_some());
    }

    #[test]
    fn test_remove_device_promotes_next_coordinator() {
        let coordinator = GroupTopologyCoordinator::new();
        let (a, b, c) = (SpeakerId::new("A"), SpeakerId::new("B"), SpeakerId::new("C"));
        let generation = coordinator.begin(&a);
        coordinator.apply(
            &a,
            generation,
            vec![GroupSnapshot::new(b.clone(), [a.clone(), c.clone()])],
        );

        let peers = coordinator.remove_device(&b);
        assert_eq!(peers, vec![a.clone(), c.clone()]);
        assert_eq!(coordinator.group_of(&c).unwrap().coordinator(), &a);
        assert!(coordinator.group_of(&b).is_none());
        assert!(coordinator.remove_device(&b).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_handle_clears_pending() {
        let coordinator = Arc::new(GroupTopologyCoordinator::new());
        let a = SpeakerId::new("A");
        coordinator.insert_standalone(&a);

        let generation = coordinator.begin(&a);
        let task = tokio::spawn(std::future::pending::<Result<RegroupOutcome>>());
        coordinator.attach(&a, generation, task.abort_handle());
        let handle = RegroupHandle::new(task, a.clone(), generation, coordinator.clone());
        assert_eq!(coordinator.pending(), 1);

        handle.cancel();
        assert_eq!(coordinator.pending(), 0);
        assert_eq!(handle.await.unwrap(), RegroupOutcome::Superseded);
    }

    #[tokio::test]
    async fn test_cancelling_stale_handle_keeps_newer_regroup() {
        let coordinator = Arc::new(GroupTopologyCoordinator::new());
        let a = SpeakerId::new("A");

        let old = coordinator.begin(&a);
        let task = tokio::spawn(std::future::pending::<Result<RegroupOutcome>>());
        let stale = RegroupHandle::new(task, a.clone(), old, coordinator.clone());
        let new = coordinator.begin(&a);

        stale.cancel();
        assert_eq!(coordinator.pending(), 1);
        assert!(coordinator
            .apply(&a, new, vec![GroupSnapshot::standalone(a.clone())])
            .is_some());
    }

    fn arb_topology() -> impl Strategy<Value = (Vec<ZoneGroup>, BTreeSet<SpeakerId>)> {
        let names = prop::sample::subsequence(vec!["A", "B", "C", "D", "E", "F"], 0..=6);
        let groups = prop::collection::vec(
            (
                prop::sample::subsequence(vec!["A", "B", "C", "D", "E", "F", "G"], 0..=4),
                prop::option::of(prop::sample::select(vec!["A", "B", "C", "G"])),
            ),
            0..4,
        );
        (groups, names).prop_map(|(groups, known)| {
            let topology = groups
                .into_iter()
                .map(|(members, coordinator)| group(coordinator, &members))
                .collect();
            (topology, known.into_iter().map(SpeakerId::new).collect())
        })
    }

    proptest! {
        #[test]
        fn prop_every_known_device_in_exactly_one_group((topology, known) in arb_topology()) {
            let groups = resolve_groups(&topology, &known);
            let mut seen = BTreeSet::new();
            for snapshot in &groups {
                for member in snapshot.members() {
                    prop_assert!(known.contains(member));
                    prop_assert!(seen.insert(member.clone()));
                }
            }
            prop_assert_eq!(seen, known);
        }

        #[test]
        fn prop_resolution_is_deterministic((topology, known) in arb_topology()) {
            let first = resolve_groups(&topology, &known);
            let second = resolve_groups(&topology, &known);
            prop_assert_eq!(&first, &second);
            for snapshot in &first {
                let rest = &snapshot.members()[1..];
                prop_assert!(rest.windows(2).all(|pair| pair[0] < pair[1]));
            }
        }
    }
}
