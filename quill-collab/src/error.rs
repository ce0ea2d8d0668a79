//! Crate-level error type.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;
use crate::transport::TransportError;

/// Errors surfaced by session binding and document access.
///
/// Transport failures during normal operation are absorbed into the
/// connection status and never reach callers through this type; they only
/// appear here when binding itself fails.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("invalid document id: {0:?}")]
    InvalidDocumentId(String),

    #[error("session for document {0} has been destroyed")]
    SessionDestroyed(String),

    #[error("document error: {0}")]
    Document(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, CollabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CollabError::InvalidDocumentId(String::new());
        assert_eq!(err.to_string(), "invalid document id: \"\"");

        let err = CollabError::SessionDestroyed("doc-1".into());
        assert_eq!(err.to_string(), "session for document doc-1 has been destroyed");
    }

    #[test]
    fn test_error_from_store() {
        let err: CollabError = StoreError::Database("disk full".into()).into();
        assert!(matches!(err, CollabError::Store(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
