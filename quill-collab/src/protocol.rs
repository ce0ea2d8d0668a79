//! Binary peer protocol used between transports of the same document.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬─────────────┬──────────┐
//! │ msg_type │ from      │ document_id │ payload  │
//! │ 1 byte   │ varint    │ string      │ variable │
//! └──────────┴───────────┴─────────────┴──────────┘
//! ```
//!
//! Sync follows the two-step Yrs handshake: a joining peer broadcasts its
//! state vector (`SyncStep1`), every peer answers with the missing updates
//! (`SyncStep2`) and its own state vector, and from then on incremental
//! updates flow as `Update`. Presence rides along as `Awareness` payloads.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::awareness::{AwarenessMessage, ClientId};

/// Message types for the peer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asking the receiver for what the sender lacks
    SyncStep1 = 1,
    /// Yrs update answering a `SyncStep1`
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Encoded [`AwarenessMessage`]
    Awareness = 4,
    /// Sender left the document room
    Leave = 5,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    pub msg_type: MessageType,
    /// Client id of the sending document replica
    pub from: ClientId,
    pub document_id: String,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl PeerMessage {
    fn new(msg_type: MessageType, from: ClientId, document_id: &str, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            from,
            document_id: document_id.to_owned(),
            payload,
        }
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(from: ClientId, document_id: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, from, document_id, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(from: ClientId, document_id: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, from, document_id, diff)
    }

    /// Create an incremental update message.
    pub fn update(from: ClientId, document_id: &str, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, from, document_id, update)
    }

    /// Create a presence message.
    pub fn awareness(
        from: ClientId,
        document_id: &str,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Awareness, from, document_id, message.encode()?))
    }

    /// Create a leave notification.
    pub fn leave(from: ClientId, document_id: &str) -> Self {
        Self::new(MessageType::Leave, from, document_id, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the presence payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        AwarenessMessage::decode(&self.payload)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type: {0:?}")]
    InvalidMessageType(MessageType),
}
