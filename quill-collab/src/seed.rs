//! First-sync seeding of empty documents.
//!
//! A freshly created document has an empty content array. After the first
//! `synced = true` event of a session, the coordinator checks the content
//! once; if nothing arrived from peers or from the local store, it inserts
//! the default paragraph.
//!
//! Two peers that sync a brand new document at the same time can both see
//! it empty and both seed it. Yrs merges both inserts, so the document ends
//! up with two default paragraphs. This is accepted and only logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::events::Subscription;
use crate::session::DocumentSession;
use crate::transport::SyncEvent;

/// Watches a session's sync events and seeds the document at most once.
pub struct SeedCoordinator {
    document_id: String,
    checked: Arc<AtomicBool>,
    seeded: Arc<AtomicBool>,
    subscription: Option<Subscription>,
}

impl SeedCoordinator {
    pub fn attach(session: &Arc<DocumentSession>) -> Result<Self> {
        let transport = session.transport()?;
        let checked = Arc::new(AtomicBool::new(false));
        let seeded = Arc::new(AtomicBool::new(false));

        let weak = Arc::downgrade(session);
        let once = checked.clone();
        let done = seeded.clone();
        let subscription = transport.sync_events().subscribe(move |event: &SyncEvent| {
            if !event.synced {
                return;
            }
            if once.swap(true, Ordering::AcqRel) {
                return;
            }
            let Some(session) = weak.upgrade() else {
                return;
            };
            match session.seed_if_empty() {
                Ok(true) => {
                    done.store(true, Ordering::Release);
                    log::debug!(
                        "Seeded {} with default content (concurrent seeds from other peers are not deduplicated)",
                        session.document_id()
                    );
                }
                Ok(false) => log::debug!("{} already has content after sync", session.document_id()),
                Err(e) => log::warn!("Skipping seed for {}: {e}", session.document_id()),
            }
        });

        Ok(Self {
            document_id: session.document_id().to_owned(),
            checked,
            seeded,
            subscription: Some(subscription),
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Whether the post-sync check already ran.
    pub fn has_checked(&self) -> bool {
        self.checked.load(Ordering::Acquire)
    }

    /// Whether this coordinator inserted the default content.
    pub fn seeded(&self) -> bool {
        self.seeded.load(Ordering::Acquire)
    }

    pub fn detach(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

impl std::fmt::Debug for SeedCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedCoordinator")
            .field("document_id", &self.document_id)
            .field("checked", &self.has_checked())
            .field("seeded", &self.seeded())
            .finish()
    }
}
