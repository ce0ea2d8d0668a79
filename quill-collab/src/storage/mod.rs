//! Local persistence for replicated documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  update_v1   ┌──────────────────┐   append    ┌─────────────┐
//! │ Yrs Doc     │ ───────────► │ LocalPersistence │ ──────────► │ UpdateStore │
//! │             │ ◄─────────── │ (bind / restore) │ ◄────────── │ memory/rocks│
//! └─────────────┘   on bind    └──────────────────┘    load     └─────────────┘
//! ```
//!
//! Stores keep an append-only log of encoded Yrs updates per document id.
//! Once the log grows past the configured threshold, [`LocalPersistence`]
//! merges it into a single update and swaps it in with
//! [`UpdateStore::replace`].

pub mod persistence;
#[cfg(feature = "rocksdb")]
pub mod rocks;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

pub use persistence::{LocalPersistence, PERSISTENCE_ORIGIN};
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksUpdateStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend failure
    #[error("Database error: {0}")]
    Database(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

/// Append-only update log keyed by document id.
pub trait UpdateStore: Send + Sync {
    /// Every stored update for `document_id`, oldest first.
    fn load(&self, document_id: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Append one update. Returns how many updates are now stored for
    /// the document.
    fn append(&self, document_id: &str, update: &[u8]) -> Result<usize, StoreError>;

    /// Replace the whole log with a single (merged) update.
    fn replace(&self, document_id: &str, merged: &[u8]) -> Result<(), StoreError>;

    fn clear(&self, document_id: &str) -> Result<(), StoreError>;

    /// Ids of every document with at least one stored update.
    fn documents(&self) -> Result<Vec<String>, StoreError>;
}

/// Volatile [`UpdateStore`]; the log lives as long as the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn logs(&self) -> MutexGuard<'_, HashMap<String, Vec<Vec<u8>>>> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UpdateStore for MemoryStore {
    fn load(&self, document_id: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self.logs().get(document_id).cloned().unwrap_or_default())
    }

    fn append(&self, document_id: &str, update: &[u8]) -> Result<usize, StoreError> {
        let mut logs = self.logs();
        let log = logs.entry(document_id.to_owned()).or_default();
        log.push(update.to_vec());
        Ok(log.len())
    }

    fn replace(&self, document_id: &str, merged: &[u8]) -> Result<(), StoreError> {
        self.logs().insert(document_id.to_owned(), vec![merged.to_vec()]);
        Ok(())
    }

    fn clear(&self, document_id: &str) -> Result<(), StoreError> {
        self.logs().remove(document_id);
        Ok(())
    }

    fn documents(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .logs()
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
