//! In-process transport.
//!
//! [`MemoryHub`] plays the role of the peer network: transports join a room
//! per document id and exchange [`PeerMessage`] frames through a single FIFO
//! queue. Nothing moves until [`MemoryHub::pump`] is called, which makes
//! every interleaving reproducible in tests.
//!
//! ```text
//!  MemoryTransport(A) ──send──┐                ┌──receive──▶ MemoryTransport(B)
//!                             ▼                │
//!                      ┌─────────────┐  pump() │
//!                      │ FIFO queue  │─────────┤
//!                      └─────────────┘         └──receive──▶ MemoryTransport(C)
//! ```
//!
//! ## Join handshake
//!
//! 1. The joiner records every peer already in the room as "waiting", then
//!    broadcasts `SyncStep1` and its local awareness.
//! 2. Each peer answers the broadcast with `SyncStep2` (the joiner's missing
//!    updates), its own `SyncStep1`, and its local awareness.
//! 3. The joiner answers each direct `SyncStep1` with `SyncStep2`.
//! 4. Once every waiting peer delivered `SyncStep2` (or left), the joiner
//!    emits `synced = true`. A joiner alone in its room is synced at once.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

use super::{
    StatusEvent, SyncEvent, Transport, TransportError, TransportFactory, TransportStatus,
    REMOTE_ORIGIN,
};
use crate::awareness::{Awareness, ClientId, UpdateOrigin};
use crate::config::HubConfig;
use crate::events::{EventEmitter, Subscription};
use crate::protocol::{MessageType, PeerMessage};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────────
// Hub
// ───────────────────────────────────────────────────────────────────

struct Envelope {
    document_id: String,
    from: ClientId,
    /// `None` broadcasts to the whole room except the sender
    to: Option<ClientId>,
    bytes: Arc<Vec<u8>>,
}

struct HubState {
    rooms: HashMap<String, BTreeMap<ClientId, Weak<PeerLink>>>,
    queue: VecDeque<Envelope>,
    reachable: bool,
}

impl HubState {
    fn recipients(&self, envelope: &Envelope) -> Vec<Arc<PeerLink>> {
        let Some(room) = self.rooms.get(&envelope.document_id) else {
            return Vec::new();
        };
        match envelope.to {
            Some(to) => room.get(&to).and_then(Weak::upgrade).into_iter().collect(),
            None => room
                .iter()
                .filter(|(id, _)| **id != envelope.from)
                .filter_map(|(_, link)| link.upgrade())
                .collect(),
        }
    }
}

struct HubShared {
    config: HubConfig,
    state: Mutex<HubState>,
}

impl HubShared {
    fn lock(&self) -> MutexGuard<'_, HubState> {
        lock(&self.state)
    }
}

/// Shared in-process peer network.
#[derive(Clone)]
pub struct MemoryHub {
    shared: Arc<HubShared>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    pub fn with_config(config: HubConfig) -> Self {
        Self {
            shared: Arc::new(HubShared {
                config,
                state: Mutex::new(HubState {
                    rooms: HashMap::new(),
                    queue: VecDeque::new(),
                    reachable: true,
                }),
            }),
        }
    }

    /// While unreachable, every `connect()` fails. Established links are
    /// left alone.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.lock().reachable = reachable;
        log::info!("Memory hub reachable: {reachable}");
    }

    pub fn is_reachable(&self) -> bool {
        self.shared.lock().reachable
    }

    /// Number of connected transports in a document room.
    pub fn peer_count(&self, document_id: &str) -> usize {
        self.shared
            .lock()
            .rooms
            .get(document_id)
            .map_or(0, |room| room.values().filter(|link| link.strong_count() > 0).count())
    }

    /// Messages waiting for delivery.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Deliver queued messages in FIFO order until the queue is empty or the
    /// per-pump bound is hit. Messages produced while delivering are queued
    /// behind the current ones. Returns the number of messages processed.
    pub fn pump(&self) -> usize {
        let limit = self.shared.config.max_deliveries_per_pump;
        let mut processed = 0;

        while processed < limit {
            let (envelope, recipients) = {
                let mut state = self.shared.lock();
                let Some(envelope) = state.queue.pop_front() else {
                    break;
                };
                let recipients = state.recipients(&envelope);
                (envelope, recipients)
            };

            for link in recipients {
                link.receive(&envelope);
            }
            processed += 1;
        }

        if processed == limit && self.pending() > 0 {
            log::warn!(
                "Memory hub pump stopped after {processed} messages, {} still queued",
                self.pending()
            );
        }
        processed
    }

    /// Bind a new transport to `doc` under `document_id`.
    pub fn transport(&self, document_id: &str, doc: &Doc) -> Result<MemoryTransport, TransportError> {
        MemoryTransport::new(self, document_id, doc)
    }

    pub fn factory(&self) -> MemoryTransportFactory {
        MemoryTransportFactory { hub: self.clone() }
    }

    fn enqueue(&self, envelope: Envelope) {
        self.shared.lock().queue.push_back(envelope);
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("MemoryHub")
            .field("rooms", &state.rooms.len())
            .field("pending", &state.queue.len())
            .field("reachable", &state.reachable)
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Peer link
// ───────────────────────────────────────────────────────────────────

struct LinkState {
    status: TransportStatus,
    synced: bool,
    /// Peers whose `SyncStep2` we still expect
    waiting: BTreeSet<ClientId>,
    destroyed: bool,
}

struct PeerLink {
    document_id: String,
    client_id: ClientId,
    hub: Weak<HubShared>,
    doc: Mutex<Option<Doc>>,
    awareness: Arc<Awareness>,
    status_events: EventEmitter<StatusEvent>,
    sync_events: EventEmitter<SyncEvent>,
    state: Mutex<LinkState>,
}

impl PeerLink {
    fn hub(&self) -> Option<MemoryHub> {
        self.hub.upgrade().map(|shared| MemoryHub { shared })
    }

    fn doc(&self) -> Option<Doc> {
        lock(&self.doc).clone()
    }

    fn status(&self) -> TransportStatus {
        lock(&self.state).status
    }

    fn send(&self, to: Option<ClientId>, message: PeerMessage) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode {:?} for {}: {e}", message.msg_type, self.document_id);
                return;
            }
        };
        if let Some(hub) = self.hub() {
            hub.enqueue(Envelope {
                document_id: self.document_id.clone(),
                from: self.client_id,
                to,
                bytes: Arc::new(bytes),
            });
        }
    }

    fn set_status(&self, status: TransportStatus) {
        {
            let mut state = lock(&self.state);
            if state.status == status {
                return;
            }
            state.status = status;
        }
        log::info!("Transport {} [{}]: {status}", self.document_id, self.client_id);
        self.status_events.emit(&StatusEvent { status });
    }

    fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        {
            let state = lock(&self.state);
            if state.destroyed {
                return Err(TransportError::Destroyed(self.document_id.clone()));
            }
            if state.status != TransportStatus::Disconnected {
                return Ok(());
            }
        }
        let Some(hub) = self.hub() else {
            return Err(TransportError::Unreachable);
        };

        self.set_status(TransportStatus::Connecting);

        let existing = {
            let mut hub_state = hub.shared.lock();
            if !hub_state.reachable {
                None
            } else {
                let room = hub_state.rooms.entry(self.document_id.clone()).or_default();
                room.retain(|_, link| link.strong_count() > 0);
                let existing: BTreeSet<ClientId> =
                    room.keys().copied().filter(|id| *id != self.client_id).collect();
                room.insert(self.client_id, Arc::downgrade(self));
                Some(existing)
            }
        };
        let Some(existing) = existing else {
            self.set_status(TransportStatus::Disconnected);
            return Err(TransportError::Unreachable);
        };

        log::debug!(
            "Transport {} [{}] joined room with {} peer(s)",
            self.document_id,
            self.client_id,
            existing.len()
        );
        lock(&self.state).waiting = existing;
        self.set_status(TransportStatus::Connected);

        if let Some(doc) = self.doc() {
            let state_vector = doc.transact().state_vector().encode_v1();
            self.send(None, PeerMessage::sync_step1(self.client_id, &self.document_id, state_vector));
        }
        self.broadcast_awareness();
        self.settle();
        Ok(())
    }

    fn disconnect(&self) {
        let was_synced = {
            let mut state = lock(&self.state);
            if state.status == TransportStatus::Disconnected {
                return;
            }
            state.status = TransportStatus::Disconnected;
            state.waiting.clear();
            std::mem::replace(&mut state.synced, false)
        };

        if let Some(hub) = self.hub() {
            let mut hub_state = hub.shared.lock();
            if let Some(room) = hub_state.rooms.get_mut(&self.document_id) {
                room.remove(&self.client_id);
                if room.is_empty() {
                    hub_state.rooms.remove(&self.document_id);
                }
            }
        }
        self.send(None, PeerMessage::leave(self.client_id, &self.document_id));
        self.awareness.remove_remote_states();

        log::info!("Transport {} [{}]: disconnected", self.document_id, self.client_id);
        self.status_events.emit(&StatusEvent {
            status: TransportStatus::Disconnected,
        });
        if was_synced {
            self.sync_events.emit(&SyncEvent { synced: false });
        }
    }

    /// Emit `synced = true` once nobody is left to wait for.
    fn settle(&self) {
        {
            let mut state = lock(&self.state);
            if state.status != TransportStatus::Connected || state.synced || !state.waiting.is_empty() {
                return;
            }
            state.synced = true;
        }
        log::debug!("Transport {} [{}] synced", self.document_id, self.client_id);
        self.sync_events.emit(&SyncEvent { synced: true });
    }

    fn broadcast_update(&self, update: Vec<u8>) {
        if self.status() != TransportStatus::Connected {
            return;
        }
        self.send(None, PeerMessage::update(self.client_id, &self.document_id, update));
    }

    fn broadcast_awareness(&self) {
        self.send_awareness(None);
    }

    fn send_awareness(&self, to: Option<ClientId>) {
        if self.status() != TransportStatus::Connected {
            return;
        }
        let message = self.awareness.local_message();
        if message.is_empty() {
            return;
        }
        match PeerMessage::awareness(self.client_id, &self.document_id, &message) {
            Ok(frame) => self.send(to, frame),
            Err(e) => log::error!("Failed to encode awareness for {}: {e}", self.document_id),
        }
    }

    fn receive(&self, envelope: &Envelope) {
        if self.status() != TransportStatus::Connected {
            return;
        }
        let message = match PeerMessage::decode(&envelope.bytes) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping malformed frame from {}: {e}", envelope.from);
                return;
            }
        };
        log::trace!(
            "Transport {} [{}] <- {:?} from {}",
            self.document_id,
            self.client_id,
            message.msg_type,
            message.from
        );

        match message.msg_type {
            MessageType::SyncStep1 => {
                self.answer_sync_step1(message.from, &message.payload, envelope.to.is_none());
            }
            MessageType::SyncStep2 => {
                self.apply_remote_update(&message.payload);
                lock(&self.state).waiting.remove(&message.from);
                self.settle();
            }
            MessageType::Update => self.apply_remote_update(&message.payload),
            MessageType::Awareness => match message.awareness_message() {
                Ok(awareness) => self.awareness.apply_message(&awareness),
                Err(e) => log::warn!("Dropping awareness from {}: {e}", message.from),
            },
            MessageType::Leave => {
                self.awareness.remove_states(&[message.from]);
                lock(&self.state).waiting.remove(&message.from);
                self.settle();
            }
        }
    }

    fn answer_sync_step1(&self, from: ClientId, payload: &[u8], broadcast: bool) {
        let Some(doc) = self.doc() else {
            return;
        };
        let remote_sv = match StateVector::decode_v1(payload) {
            Ok(sv) => sv,
            Err(e) => {
                log::warn!("Invalid state vector from {from}: {e:?}");
                return;
            }
        };
        let (diff, local_sv) = {
            let txn = doc.transact();
            (txn.encode_diff_v1(&remote_sv), txn.state_vector().encode_v1())
        };
        self.send(Some(from), PeerMessage::sync_step2(self.client_id, &self.document_id, diff));

        if broadcast {
            // A newcomer: ask for what it has and introduce ourselves.
            self.send(Some(from), PeerMessage::sync_step1(self.client_id, &self.document_id, local_sv));
            self.send_awareness(Some(from));
        }
    }

    fn apply_remote_update(&self, payload: &[u8]) {
        let Some(doc) = self.doc() else {
            return;
        };
        let update = match Update::decode_v1(payload) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Invalid update for {}: {e:?}", self.document_id);
                return;
            }
        };
        let mut txn = doc.transact_mut_with(REMOTE_ORIGIN);
        if let Err(e) = txn.apply_update(update) {
            log::warn!("Failed to apply remote update to {}: {e:?}", self.document_id);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Transport
// ───────────────────────────────────────────────────────────────────

/// [`Transport`] over a [`MemoryHub`].
pub struct MemoryTransport {
    link: Arc<PeerLink>,
    doc_subscription: Mutex<Option<yrs::Subscription>>,
    awareness_subscription: Mutex<Option<Subscription>>,
}

impl MemoryTransport {
    fn new(hub: &MemoryHub, document_id: &str, doc: &Doc) -> Result<Self, TransportError> {
        let client_id = doc.client_id();
        let link = Arc::new(PeerLink {
            document_id: document_id.to_owned(),
            client_id,
            hub: Arc::downgrade(&hub.shared),
            doc: Mutex::new(Some(doc.clone())),
            awareness: Arc::new(Awareness::new(client_id)),
            status_events: EventEmitter::new(),
            sync_events: EventEmitter::new(),
            state: Mutex::new(LinkState {
                status: TransportStatus::Disconnected,
                synced: false,
                waiting: BTreeSet::new(),
                destroyed: false,
            }),
        });

        let weak = Arc::downgrade(&link);
        let remote = Origin::from(REMOTE_ORIGIN);
        let doc_subscription = doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&remote) {
                    return;
                }
                if let Some(link) = weak.upgrade() {
                    link.broadcast_update(event.update.clone());
                }
            })
            .map_err(|e| TransportError::Observe(format!("{e:?}")))?;

        let weak = Arc::downgrade(&link);
        let awareness_subscription = link.awareness.on_update(move |update| {
            if update.origin != UpdateOrigin::Local {
                return;
            }
            if let Some(link) = weak.upgrade() {
                link.broadcast_awareness();
            }
        });

        log::debug!("Created memory transport for {document_id} [{client_id}]");
        Ok(Self {
            link,
            doc_subscription: Mutex::new(Some(doc_subscription)),
            awareness_subscription: Mutex::new(Some(awareness_subscription)),
        })
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.link.state).destroyed
    }
}

impl Transport for MemoryTransport {
    fn document_id(&self) -> &str {
        &self.link.document_id
    }

    fn client_id(&self) -> ClientId {
        self.link.client_id
    }

    fn connect(&self) -> Result<(), TransportError> {
        self.link.connect()
    }

    fn disconnect(&self) {
        self.link.disconnect();
    }

    fn status(&self) -> TransportStatus {
        self.link.status()
    }

    fn is_synced(&self) -> bool {
        lock(&self.link.state).synced
    }

    fn status_events(&self) -> &EventEmitter<StatusEvent> {
        &self.link.status_events
    }

    fn sync_events(&self) -> &EventEmitter<SyncEvent> {
        &self.link.sync_events
    }

    fn awareness(&self) -> &Arc<Awareness> {
        &self.link.awareness
    }

    fn destroy(&self) {
        if self.is_destroyed() {
            return;
        }
        self.link.disconnect();
        lock(&self.link.state).destroyed = true;

        lock(&self.doc_subscription).take();
        lock(&self.awareness_subscription).take();
        self.link.status_events.clear();
        self.link.sync_events.clear();
        self.link.awareness.clear_handlers();
        lock(&self.link.doc).take();

        log::debug!(
            "Destroyed memory transport for {} [{}]",
            self.link.document_id,
            self.link.client_id
        );
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("document_id", &self.link.document_id)
            .field("client_id", &self.link.client_id)
            .field("status", &self.link.status())
            .finish()
    }
}

/// [`TransportFactory`] handing out [`MemoryTransport`]s on one hub.
#[derive(Debug, Clone)]
pub struct MemoryTransportFactory {
    hub: MemoryHub,
}

impl MemoryTransportFactory {
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn open(&self, document_id: &str, doc: &Doc) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(self.hub.transport(document_id, doc)?))
    }
}
