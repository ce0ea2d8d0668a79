//! Peer presence reconciliation.
//!
//! Awareness publishes incremental notifications (`added`, `updated`,
//! `removed`). [`reconcile`] folds one notification into the previous peer
//! snapshot, producing the list the editor renders:
//!
//! ```text
//! previous ──┐
//!            ├─ drop ids in removed ∪ added ∪ updated
//! change  ───┤
//!            ├─ re-add added ∪ updated from the current state map
//! current ───┘
//!            └─ sort by id
//! ```
//!
//! The fold is pure; [`PresenceTracker`] is the stateful glue that runs it
//! inside the awareness update handler.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::awareness::{Awareness, AwarenessUpdate, ClientId};
use crate::events::Subscription;
use crate::identity::{CursorColor, PresenceState};

/// One peer in the rendered presence list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerEntry {
    pub id: ClientId,
    pub presence: PresenceState,
}

/// Fold one awareness notification into the previous snapshot.
///
/// The result holds exactly the ids of `previous` not mentioned by `change`,
/// plus every id in `change.added ∪ change.updated` that still has a payload
/// in `current`, sorted ascending by id. Ids announced without a payload are
/// stale notifications and are skipped.
pub fn reconcile(
    previous: &[PeerEntry],
    current: &HashMap<ClientId, PresenceState>,
    change: &AwarenessUpdate,
) -> Vec<PeerEntry> {
    let touched: HashSet<ClientId> = change.changed().collect();

    let mut next: Vec<PeerEntry> = previous
        .iter()
        .filter(|peer| !touched.contains(&peer.id))
        .cloned()
        .collect();

    let mut seen = HashSet::new();
    for &id in change.updated.iter().chain(&change.added) {
        if !seen.insert(id) {
            continue;
        }
        match current.get(&id) {
            Some(presence) => next.push(PeerEntry {
                id,
                presence: presence.clone(),
            }),
            None => log::trace!("Skipping stale presence notification for client {id}"),
        }
    }

    next.sort_by_key(|peer| peer.id);
    next
}

/// Avatar view model for one remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerAvatar {
    pub id: ClientId,
    pub name: String,
    pub photo_url: String,
    /// CSS color for the avatar border
    pub border_color: String,
    pub cursor_color: CursorColor,
}

impl PeerAvatar {
    pub fn from_entry(entry: &PeerEntry) -> Self {
        Self {
            id: entry.id,
            name: entry.presence.name.clone(),
            photo_url: entry.presence.photo_url.clone(),
            border_color: entry.presence.color.clone(),
            cursor_color: entry.presence.cursor_color(),
        }
    }
}

/// Keeps a reconciled peer snapshot in step with an awareness channel.
pub struct PresenceTracker {
    peers: Arc<Mutex<Vec<PeerEntry>>>,
    subscription: Option<Subscription>,
}

fn lock(peers: &Mutex<Vec<PeerEntry>>) -> MutexGuard<'_, Vec<PeerEntry>> {
    peers.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PresenceTracker {
    /// Start tracking `awareness`. The snapshot begins empty and only
    /// changes on `update` events, so presence announced before attaching
    /// shows up at the next notification for that client.
    pub fn attach(awareness: &Arc<Awareness>) -> Self {
        let peers = Arc::new(Mutex::new(Vec::new()));

        let snapshot = peers.clone();
        let source = Arc::downgrade(awareness);
        let subscription = awareness.on_update(move |change| {
            let Some(awareness) = source.upgrade() else {
                return;
            };
            let current = awareness.get_states();
            let mut peers = lock(&snapshot);
            *peers = reconcile(&peers, &current, change);
            log::debug!(
                "Presence now {} client(s) on replica {}",
                peers.len(),
                awareness.client_id()
            );
        });

        Self {
            peers,
            subscription: Some(subscription),
        }
    }

    /// Current snapshot, all clients included.
    pub fn peers(&self) -> Vec<PeerEntry> {
        lock(&self.peers).clone()
    }

    /// Snapshot without the local client, for rendering.
    pub fn remote_peers(&self, local_id: ClientId) -> Vec<PeerEntry> {
        lock(&self.peers)
            .iter()
            .filter(|peer| peer.id != local_id)
            .cloned()
            .collect()
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_some()
    }

    /// Stop listening. The last snapshot stays readable.
    pub fn detach(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("peers", &lock(&self.peers).len())
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::{AwarenessEntry, AwarenessMessage, UpdateOrigin};

    fn presence(name: &str) -> PresenceState {
        PresenceState::new(name, format!("https://example.test/{name}.jpg"), CursorColor::default())
    }

    fn change(added: &[u64], updated: &[u64], removed: &[u64]) -> AwarenessUpdate {
        AwarenessUpdate {
            added: added.to_vec(),
            updated: updated.to_vec(),
            removed: removed.to_vec(),
            origin: UpdateOrigin::Remote,
        }
    }

    fn entry(id: u64, name: &str) -> PeerEntry {
        PeerEntry { id, presence: presence(name) }
    }

    // ── Reconciliation ──────────────────────────────────────

    #[test]
    fn test_added_peers_sorted() {
        let current = HashMap::from([(7, presence("P")), (3, presence("Q"))]);
        let peers = reconcile(&[], &current, &change(&[7, 3], &[], &[]));
        assert_eq!(peers, vec![entry(3, "Q"), entry(7, "P")]);
    }

    #[test]
    fn test_updated_payload_replaces_entry() {
        let previous = vec![entry(3, "Q"), entry(7, "P")];
        let current = HashMap::from([(7, presence("P2")), (3, presence("Q"))]);
        let peers = reconcile(&previous, &current, &change(&[], &[7], &[]));
        assert_eq!(peers, vec![entry(3, "Q"), entry(7, "P2")]);
    }

    #[test]
    fn test_removed_peer_dropped() {
        let previous = vec![entry(3, "Q"), entry(7, "P")];
        let current = HashMap::from([(7, presence("P"))]);
        let peers = reconcile(&previous, &current, &change(&[], &[], &[3]));
        assert_eq!(peers, vec![entry(7, "P")]);
    }

    #[test]
    fn test_stale_notification_skipped() {
        let current = HashMap::from([(1, presence("A"))]);
        let peers = reconcile(&[], &current, &change(&[1, 2], &[], &[]));
        assert_eq!(peers, vec![entry(1, "A")]);
    }

    #[test]
    fn test_id_in_added_and_updated_appears_once() {
        let current = HashMap::from([(4, presence("D"))]);
        let peers = reconcile(&[], &current, &change(&[4], &[4], &[]));
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn test_untouched_peers_survive_even_without_payload() {
        // The fold only looks at ids named by the change.
        let previous = vec![entry(9, "Z")];
        let peers = reconcile(&previous, &HashMap::new(), &change(&[], &[], &[]));
        assert_eq!(peers, previous);
    }

    // ── Tracker ─────────────────────────────────────────────

    #[test]
    fn test_tracker_follows_awareness() {
        let awareness = Arc::new(Awareness::new(1));
        let mut tracker = PresenceTracker::attach(&awareness);

        awareness.set_local_state(Some(presence("Me")));
        awareness.apply_message(&AwarenessMessage {
            entries: vec![AwarenessEntry { client_id: 5, clock: 0, state: Some(presence("Eve")) }],
        });

        assert_eq!(tracker.peers().len(), 2);
        assert_eq!(tracker.remote_peers(1), vec![entry(5, "Eve")]);

        tracker.detach();
        awareness.remove_states(&[5]);
        assert_eq!(tracker.peers().len(), 2, "detached tracker keeps its last snapshot");
        assert!(!tracker.is_attached());
    }

    #[test]
    fn test_avatar_from_entry() {
        let avatar = PeerAvatar::from_entry(&entry(2, "Bo"));
        assert_eq!(avatar.name, "Bo");
        assert_eq!(avatar.photo_url, "https://example.test/Bo.jpg");
        assert_eq!(avatar.border_color, CursorColor::default().to_css());
    }
}
