//! Property tests for presence reconciliation.
//!
//! A model keeps the "current" awareness map and turns random batches of
//! joins, touches, leaves and ghost announcements into the `{added, updated,
//! removed}` notifications awareness would publish. The reconciled snapshot
//! is checked after every notification.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use proptest::test_runner::Config;

use quill_collab::awareness::{AwarenessUpdate, ClientId, UpdateOrigin};
use quill_collab::identity::{CursorColor, PresenceState};
use quill_collab::presence::{reconcile, PeerEntry};

// =============================================================================
// Model
// =============================================================================

fn presence(id: ClientId, version: u32) -> PresenceState {
    PresenceState::new(
        format!("peer-{id}-v{version}"),
        format!("https://example.test/{id}.jpg"),
        CursorColor::default(),
    )
}

#[derive(Debug, Clone)]
enum Op {
    /// Client announces a (new) state
    Join(ClientId),
    /// Client re-announces with a changed state
    Touch(ClientId),
    Leave(ClientId),
    /// Notification for a client whose state is already gone
    Ghost(ClientId),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..8).prop_map(Op::Join),
        (0u64..8).prop_map(Op::Touch),
        (0u64..8).prop_map(Op::Leave),
        (0u64..8).prop_map(Op::Ghost),
    ]
}

fn batches() -> impl Strategy<Value = Vec<Vec<Op>>> {
    prop::collection::vec(prop::collection::vec(op(), 0..6), 1..24)
}

#[derive(Default)]
struct Model {
    current: HashMap<ClientId, PresenceState>,
    version: u32,
}

impl Model {
    fn step(&mut self, batch: &[Op]) -> AwarenessUpdate {
        let mut update = AwarenessUpdate {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin: UpdateOrigin::Remote,
        };
        for op in batch {
            self.version += 1;
            match *op {
                Op::Join(id) | Op::Touch(id) => {
                    if self.current.insert(id, presence(id, self.version)).is_none() {
                        update.added.push(id);
                    } else {
                        update.updated.push(id);
                    }
                }
                Op::Leave(id) => {
                    if self.current.remove(&id).is_some() {
                        update.removed.push(id);
                    }
                }
                Op::Ghost(id) => {
                    if !self.current.contains_key(&id) {
                        update.added.push(id);
                    }
                }
            }
        }
        update
    }
}

fn ids(snapshot: &[PeerEntry]) -> Vec<ClientId> {
    snapshot.iter().map(|peer| peer.id).collect()
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(Config {
        cases: 256,
        fork: false,
        ..Config::default()
    })]

    /// Replaying a notification against an unchanged map changes nothing.
    #[test]
    fn replay_is_idempotent(batches in batches()) {
        let mut model = Model::default();
        let mut snapshot = Vec::new();
        for batch in &batches {
            let change = model.step(batch);
            let once = reconcile(&snapshot, &model.current, &change);
            let twice = reconcile(&once, &model.current, &change);
            prop_assert_eq!(&once, &twice);
            snapshot = once;
        }
    }

    /// Output is strictly ascending by id: sorted and free of duplicates.
    #[test]
    fn output_sorted_without_duplicates(batches in batches()) {
        let mut model = Model::default();
        let mut snapshot = Vec::new();
        for batch in &batches {
            let change = model.step(batch);
            snapshot = reconcile(&snapshot, &model.current, &change);

            let ids = ids(&snapshot);
            prop_assert!(ids.windows(2).all(|w| w[0] < w[1]), "not strictly ascending: {:?}", ids);
            let unique: HashSet<ClientId> = ids.iter().copied().collect();
            prop_assert_eq!(unique.len(), ids.len());
        }
    }

    /// A removed client stays out until it is announced again.
    #[test]
    fn removed_clients_stay_removed(batches in batches()) {
        let mut model = Model::default();
        let mut snapshot = Vec::new();
        let mut gone: HashSet<ClientId> = HashSet::new();
        for batch in &batches {
            let change = model.step(batch);
            snapshot = reconcile(&snapshot, &model.current, &change);

            let announced: HashSet<ClientId> =
                change.added.iter().chain(&change.updated).copied().collect();
            for id in &change.removed {
                if !announced.contains(id) {
                    gone.insert(*id);
                }
            }
            for id in &announced {
                gone.remove(id);
            }

            for peer in &snapshot {
                prop_assert!(!gone.contains(&peer.id), "client {} resurfaced", peer.id);
            }
        }
    }

    /// With every change announced, the snapshot mirrors the awareness map.
    #[test]
    fn snapshot_mirrors_current_map(batches in batches()) {
        let mut model = Model::default();
        let mut snapshot = Vec::new();
        for batch in &batches {
            let change = model.step(batch);
            snapshot = reconcile(&snapshot, &model.current, &change);

            let mut expected: Vec<PeerEntry> = model
                .current
                .iter()
                .map(|(id, presence)| PeerEntry { id: *id, presence: presence.clone() })
                .collect();
            expected.sort_by_key(|peer| peer.id);
            prop_assert_eq!(&snapshot, &expected);
        }
    }
}

// =============================================================================
// Scenarios
// =============================================================================

fn change(added: &[ClientId], removed: &[ClientId]) -> AwarenessUpdate {
    AwarenessUpdate {
        added: added.to_vec(),
        updated: Vec::new(),
        removed: removed.to_vec(),
        origin: UpdateOrigin::Remote,
    }
}

fn entry(id: ClientId, name: &str) -> PeerEntry {
    PeerEntry {
        id,
        presence: PresenceState::new(name, "https://example.test/p.jpg", CursorColor::default()),
    }
}

#[test]
fn first_peer_added_to_empty_snapshot() {
    let a = entry(1, "A");
    let current = HashMap::from([(1, a.presence.clone())]);

    let snapshot = reconcile(&[], &current, &change(&[1], &[]));
    assert_eq!(snapshot, vec![a]);
}

#[test]
fn removed_peer_leaves_the_rest() {
    let one = entry(1, "A");
    let two = entry(2, "B");
    let current = HashMap::from([(2, two.presence.clone())]);

    let snapshot = reconcile(&[one, two.clone()], &current, &change(&[], &[1]));
    assert_eq!(snapshot, vec![two]);
}

#[test]
fn added_peer_is_sorted_in() {
    let one = entry(1, "A");
    let two = entry(2, "B");
    let current = HashMap::from([(1, one.presence.clone()), (2, two.presence.clone())]);

    let snapshot = reconcile(&[two.clone()], &current, &change(&[1], &[]));
    assert_eq!(snapshot, vec![one, two]);
}
