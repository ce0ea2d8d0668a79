//! Awareness channel: ephemeral per-client presence for one document.
//!
//! Every replica owns one [`Awareness`]. It maps numeric client ids to the
//! latest [`PresenceState`] announced by that client and publishes an
//! [`AwarenessUpdate`] whenever the map changes, whether from the local
//! setter or from a message received off the transport.
//!
//! ## Clocks
//!
//! Each client id carries a monotonically increasing clock. A remote entry
//! is applied only when its clock is newer than what we hold, or when it has
//! the same clock and announces the client's departure. This keeps
//! out-of-order deliveries from resurrecting stale presence.
//!
//! Removing a client whose connection is gone also drops its clock: the
//! next announcement from that id starts a new life.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::events::{EventEmitter, Subscription};
use crate::identity::PresenceState;
use crate::protocol::ProtocolError;

/// Numeric id of one document replica (the Yrs client id).
pub type ClientId = u64;

/// Where an awareness change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

/// Payload of the awareness `update` event.
///
/// `updated` also lists clients that re-announced an unchanged state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: UpdateOrigin,
}

impl AwarenessUpdate {
    fn new(origin: UpdateOrigin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every id mentioned by this update.
    pub fn changed(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
    }
}

/// One client's entry on the wire. `state: None` announces departure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u32,
    pub state: Option<PresenceState>,
}

/// Encoded batch of awareness entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessMessage {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
struct AwarenessState {
    states: HashMap<ClientId, PresenceState>,
    clocks: HashMap<ClientId, u32>,
}

impl AwarenessState {
    fn entry(&self, client_id: ClientId) -> Option<AwarenessEntry> {
        let clock = *self.clocks.get(&client_id)?;
        Some(AwarenessEntry {
            client_id,
            clock,
            state: self.states.get(&client_id).cloned(),
        })
    }
}

/// Presence map for one replica.
pub struct Awareness {
    client_id: ClientId,
    state: Mutex<AwarenessState>,
    updates: EventEmitter<AwarenessUpdate>,
}

impl Awareness {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            state: Mutex::new(AwarenessState::default()),
            updates: EventEmitter::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AwarenessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn local_state(&self) -> Option<PresenceState> {
        self.lock().states.get(&self.client_id).cloned()
    }

    /// Publish (or with `None`, withdraw) the local presence.
    pub fn set_local_state(&self, state: Option<PresenceState>) {
        let update = {
            let mut inner = self.lock();
            let clock = inner.clocks.get(&self.client_id).map_or(0, |c| c + 1);
            inner.clocks.insert(self.client_id, clock);

            let mut update = AwarenessUpdate::new(UpdateOrigin::Local);
            let had_state = match state {
                Some(state) => inner.states.insert(self.client_id, state).is_some(),
                None => {
                    if inner.states.remove(&self.client_id).is_some() {
                        update.removed.push(self.client_id);
                    }
                    false
                }
            };
            if inner.states.contains_key(&self.client_id) {
                if had_state {
                    update.updated.push(self.client_id);
                } else {
                    update.added.push(self.client_id);
                }
            }
            update
        };
        self.publish(update);
    }

    /// Snapshot of every known client's presence, the local one included.
    pub fn get_states(&self) -> HashMap<ClientId, PresenceState> {
        self.lock().states.clone()
    }

    pub fn state_of(&self, client_id: ClientId) -> Option<PresenceState> {
        self.lock().states.get(&client_id).cloned()
    }

    /// Message carrying every entry we know about, departures included.
    pub fn full_message(&self) -> AwarenessMessage {
        let inner = self.lock();
        let mut ids: Vec<ClientId> = inner.clocks.keys().copied().collect();
        ids.sort_unstable();
        AwarenessMessage {
            entries: ids.into_iter().filter_map(|id| inner.entry(id)).collect(),
        }
    }

    /// Message carrying only the local entry.
    pub fn local_message(&self) -> AwarenessMessage {
        AwarenessMessage {
            entries: self.lock().entry(self.client_id).into_iter().collect(),
        }
    }

    /// Apply entries received from a peer.
    ///
    /// Entries about the local client are ignored; only this replica speaks
    /// for itself.
    pub fn apply_message(&self, message: &AwarenessMessage) {
        let update = {
            let mut inner = self.lock();
            let mut update = AwarenessUpdate::new(UpdateOrigin::Remote);

            for entry in &message.entries {
                if entry.client_id == self.client_id {
                    continue;
                }
                let present = inner.states.contains_key(&entry.client_id);
                let newer = match inner.clocks.get(&entry.client_id) {
                    None => true,
                    Some(&current) => {
                        current < entry.clock
                            || (current == entry.clock && entry.state.is_none() && present)
                    }
                };
                if !newer {
                    log::trace!(
                        "Ignoring stale awareness for client {} (clock {})",
                        entry.client_id,
                        entry.clock
                    );
                    continue;
                }

                inner.clocks.insert(entry.client_id, entry.clock);
                match &entry.state {
                    Some(state) => {
                        if inner.states.insert(entry.client_id, state.clone()).is_some() {
                            update.updated.push(entry.client_id);
                        } else {
                            update.added.push(entry.client_id);
                        }
                    }
                    None => {
                        if inner.states.remove(&entry.client_id).is_some() {
                            update.removed.push(entry.client_id);
                        }
                    }
                }
            }
            update
        };
        self.publish(update);
    }

    /// Drop remote clients, e.g. when their connection is gone. Their clocks
    /// are forgotten too, so a client that rejoins with the clock it left
    /// with is accepted again.
    pub fn remove_states(&self, client_ids: &[ClientId]) {
        let update = {
            let mut inner = self.lock();
            let mut update = AwarenessUpdate::new(UpdateOrigin::Remote);
            for &id in client_ids {
                if id == self.client_id {
                    continue;
                }
                inner.clocks.remove(&id);
                if inner.states.remove(&id).is_some() {
                    update.removed.push(id);
                }
            }
            update
        };
        self.publish(update);
    }

    /// Drop every client except ourselves.
    pub fn remove_remote_states(&self) {
        let ids: Vec<ClientId> = {
            let inner = self.lock();
            let mut ids: Vec<ClientId> = inner
                .states
                .keys()
                .copied()
                .filter(|&id| id != self.client_id)
                .collect();
            ids.sort_unstable();
            ids
        };
        self.remove_states(&ids);
    }

    /// Subscribe to the `update` event.
    pub fn on_update<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&AwarenessUpdate) + Send + Sync + 'static,
    {
        self.updates.subscribe(handler)
    }

    /// Detach every `update` handler.
    pub fn clear_handlers(&self) {
        self.updates.clear();
    }

    fn publish(&self, update: AwarenessUpdate) {
        if update.is_empty() {
            return;
        }
        log::trace!(
            "Awareness update on client {}: +{:?} ~{:?} -{:?}",
            self.client_id,
            update.added,
            update.updated,
            update.removed
        );
        self.updates.emit(&update);
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("client_id", &self.client_id)
            .field("clients", &self.lock().states.len())
            .finish()
    }
}
