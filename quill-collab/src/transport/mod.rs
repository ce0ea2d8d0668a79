//! Transport interface.
//!
//! A transport connects one replicated document to its peers. It owns the
//! document's awareness channel and reports two event streams:
//!
//! - **status**: `Connecting`, `Connected`, `Disconnected`
//! - **sync**: `synced == true` once the initial state exchange with every
//!   reachable peer finished; `false` when that state is lost
//!
//! The crate ships one implementation, [`memory::MemoryTransport`], an
//! in-process hub used by tests and the demo binary.

pub mod memory;

use std::sync::Arc;

use thiserror::Error;
use yrs::Doc;

use crate::awareness::{Awareness, ClientId};
use crate::events::EventEmitter;

pub use memory::{MemoryHub, MemoryTransport, MemoryTransportFactory};

/// Transaction origin tag for updates received from peers.
pub const REMOTE_ORIGIN: &str = "quill-remote";

/// Connection status reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransportStatus::Connecting => "connecting",
            TransportStatus::Connected => "connected",
            TransportStatus::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Payload of the `status` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: TransportStatus,
}

/// Payload of the `sync` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncEvent {
    pub synced: bool,
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer network unreachable")]
    Unreachable,
    #[error("transport for {0} has been destroyed")]
    Destroyed(String),
    #[error("failed to apply remote update: {0}")]
    Apply(String),
    #[error("failed to observe document: {0}")]
    Observe(String),
}

/// Peer-to-peer transport bound to one document.
pub trait Transport: Send + Sync {
    fn document_id(&self) -> &str;

    /// Client id of the bound document replica.
    fn client_id(&self) -> ClientId;

    /// Start connecting. Status events report progress; an error means the
    /// attempt failed outright and the transport stays disconnected.
    fn connect(&self) -> Result<(), TransportError>;

    /// Leave the peer group. Idempotent.
    fn disconnect(&self);

    fn status(&self) -> TransportStatus;

    fn is_synced(&self) -> bool;

    fn status_events(&self) -> &EventEmitter<StatusEvent>;

    fn sync_events(&self) -> &EventEmitter<SyncEvent>;

    fn awareness(&self) -> &Arc<Awareness>;

    /// Release every binding to the document. Idempotent; the transport is
    /// unusable afterwards.
    fn destroy(&self);
}

/// Creates transports for documents.
pub trait TransportFactory: Send + Sync {
    fn open(&self, document_id: &str, doc: &Doc) -> Result<Arc<dyn Transport>, TransportError>;
}
