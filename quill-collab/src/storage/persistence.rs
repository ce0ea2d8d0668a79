//! Binding between a Yrs document and an [`UpdateStore`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, Transact, Update};

use super::{StoreError, UpdateStore};
use crate::error::{CollabError, Result};

/// Transaction origin tag for updates restored from the store.
pub const PERSISTENCE_ORIGIN: &str = "quill-persistence";

/// Mirrors every update of a document into a store.
pub struct LocalPersistence {
    document_id: String,
    store: Arc<dyn UpdateStore>,
    subscription: Mutex<Option<yrs::Subscription>>,
    restored: usize,
}

impl LocalPersistence {
    /// Restore `doc` from `store`, then keep appending its updates.
    ///
    /// Stored updates that fail to decode are skipped with a warning. Once
    /// more than `compaction_threshold` updates are stored, the log is
    /// merged into one.
    pub fn bind(
        document_id: &str,
        doc: &Doc,
        store: Arc<dyn UpdateStore>,
        compaction_threshold: usize,
    ) -> Result<Self> {
        let stored = store.load(document_id)?;
        let restored = {
            let mut txn = doc.transact_mut_with(PERSISTENCE_ORIGIN);
            let mut applied = 0;
            for (idx, bytes) in stored.iter().enumerate() {
                let update = match Update::decode_v1(bytes) {
                    Ok(update) => update,
                    Err(e) => {
                        log::warn!("Skipping corrupted update #{idx} for {document_id}: {e:?}");
                        continue;
                    }
                };
                match txn.apply_update(update) {
                    Ok(()) => applied += 1,
                    Err(e) => log::warn!("Failed to restore update #{idx} for {document_id}: {e:?}"),
                }
            }
            applied
        };
        if restored > 0 {
            log::info!("Restored {document_id} from {restored} stored update(s)");
        }

        let id = document_id.to_owned();
        let sink = store.clone();
        let own = Origin::from(PERSISTENCE_ORIGIN);
        let subscription = doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&own) {
                    return;
                }
                match sink.append(&id, &event.update) {
                    Ok(count) if count > compaction_threshold => {
                        if let Err(e) = compact(sink.as_ref(), &id) {
                            log::error!("Failed to compact {id}: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Failed to persist update for {id}: {e}"),
                }
            })
            .map_err(|e| CollabError::Document(format!("cannot observe {document_id}: {e:?}")))?;

        Ok(Self {
            document_id: document_id.to_owned(),
            store,
            subscription: Mutex::new(Some(subscription)),
            restored,
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Number of stored updates applied by [`LocalPersistence::bind`].
    pub fn restored(&self) -> usize {
        self.restored
    }

    /// Merge the stored log into a single update now.
    pub fn compact(&self) -> std::result::Result<(), StoreError> {
        compact(self.store.as_ref(), &self.document_id)
    }

    /// Delete everything stored for this document.
    pub fn clear(&self) -> std::result::Result<(), StoreError> {
        self.store.clear(&self.document_id)
    }

    pub fn is_bound(&self) -> bool {
        self.subscription().is_some()
    }

    /// Stop mirroring. Stored data is kept. Idempotent.
    pub fn destroy(&self) {
        if self.subscription().take().is_some() {
            log::debug!("Released persistence binding for {}", self.document_id);
        }
    }

    fn subscription(&self) -> MutexGuard<'_, Option<yrs::Subscription>> {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for LocalPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPersistence")
            .field("document_id", &self.document_id)
            .field("restored", &self.restored)
            .field("bound", &self.is_bound())
            .finish()
    }
}

fn compact(store: &dyn UpdateStore, document_id: &str) -> std::result::Result<(), StoreError> {
    let stored = store.load(document_id)?;
    if stored.len() < 2 {
        return Ok(());
    }

    let mut decoded = Vec::with_capacity(stored.len());
    for bytes in &stored {
        let update =
            Update::decode_v1(bytes).map_err(|e| StoreError::Deserialization(format!("{e:?}")))?;
        decoded.push(update);
    }

    let merged = Update::merge_updates(decoded).encode_v1();
    store.replace(document_id, &merged)?;
    log::debug!(
        "Compacted {} updates for {document_id} into {} bytes",
        stored.len(),
        merged.len()
    );
    Ok(())
}
