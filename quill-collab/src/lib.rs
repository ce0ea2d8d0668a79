//! # quill-collab — Collaborative editing core for Quill
//!
//! Session lifecycle and peer presence for a collaborative text editor whose
//! documents are replicated with Yrs.
//!
//! ## Architecture
//!
//! ```text
//!   document id
//!        │
//!        ▼
//! ┌───────────────┐  bind   ┌──────────────────────────────────────┐
//! │ SessionBinder │ ──────► │ DocumentSession                      │
//! └───────────────┘         │  Yrs Doc ◄─ LocalPersistence ─ Store │
//!                           │     ▲                                │
//!                           │     └──── Transport ◄──► peers       │
//!                           └──────┬──────────┬──────────┬─────────┘
//!                          sync    │  status  │ awareness│
//!                                  ▼          ▼          ▼
//!                       SeedCoordinator  ConnectionController  PresenceTracker
//!                                  │          │          │
//!                                  └──────────┼──────────┘
//!                                             ▼
//!                                   CollaborativeEditor::view()
//! ```
//!
//! ## Modules
//!
//! - [`identity`] — Random local identity (name, avatar, cursor colors)
//! - [`events`] — Explicit subscribe/unsubscribe event emitter
//! - [`awareness`] — Per-document presence map with clocked wire messages
//! - [`protocol`] — Binary peer protocol (bincode-encoded PeerMessage)
//! - [`transport`] — Transport interface and the in-process hub
//! - [`storage`] — Update stores and the persistence binding
//! - [`session`] — Session binder and content nodes
//! - [`seed`] — First-sync seeding of empty documents
//! - [`presence`] — Presence reconciliation into a sorted peer list
//! - [`lifecycle`] — Connection lifecycle controller
//! - [`editor`] — Editor facade tying everything to one view

pub mod awareness;
pub mod config;
pub mod editor;
pub mod error;
pub mod events;
pub mod identity;
pub mod lifecycle;
pub mod presence;
pub mod protocol;
pub mod seed;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    Awareness, AwarenessEntry, AwarenessMessage, AwarenessUpdate, ClientId, UpdateOrigin,
};
pub use config::{HubConfig, SessionConfig};
pub use editor::{CollaborativeEditor, EditorView};
pub use error::{CollabError, Result};
pub use events::{EventEmitter, Subscription};
pub use identity::{generate_local_presence, CursorColor, PresenceState};
pub use lifecycle::{ConnectionController, ConnectionPhase};
pub use presence::{reconcile, PeerAvatar, PeerEntry, PresenceTracker};
pub use protocol::{MessageType, PeerMessage, ProtocolError};
pub use seed::SeedCoordinator;
pub use session::{ContentNode, DocumentSession, SessionBinder, TextLeaf};
pub use storage::{LocalPersistence, MemoryStore, StoreError, UpdateStore};
#[cfg(feature = "rocksdb")]
pub use storage::{RocksUpdateStore, StoreConfig};
pub use transport::{
    MemoryHub, MemoryTransport, MemoryTransportFactory, StatusEvent, SyncEvent, Transport,
    TransportError, TransportFactory, TransportStatus,
};
