//! Per-document collaboration sessions.
//!
//! A [`DocumentSession`] bundles the three live resources of one open
//! document: the Yrs [`Doc`], the peer [`Transport`] bound to it, and the
//! [`LocalPersistence`] mirroring it into an [`UpdateStore`].
//!
//! ```text
//!                 SessionBinder::bind("doc-1")
//!                            │
//!          ┌─────────────────┼──────────────────┐
//!          ▼                 ▼                  ▼
//!   ┌────────────┐   ┌──────────────┐   ┌───────────────┐
//!   │ Yrs Doc    │◄──│ Persistence  │   │ Transport     │
//!   │ "content"  │   │ (restore,    │   │ (peers,       │
//!   │  array     │◄──│  mirror)     │   │  awareness)   │──► peers
//!   └────────────┘   └──────────────┘   └───────────────┘
//! ```
//!
//! [`SessionBinder`] memoizes sessions by document id and destroys each one
//! exactly once on [`SessionBinder::unbind`]. After that every accessor of
//! the session returns [`CollabError::SessionDestroyed`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use yrs::types::ToJson;
use yrs::{Any, Array, ArrayRef, Doc, Transact};

use crate::awareness::{Awareness, ClientId};
use crate::config::SessionConfig;
use crate::error::{CollabError, Result};
use crate::storage::{LocalPersistence, UpdateStore};
use crate::transport::{Transport, TransportFactory};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────────
// Content nodes
// ───────────────────────────────────────────────────────────────────

/// A run of text inside a [`ContentNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextLeaf {
    pub text: String,
}

/// Block-level element of the shared content array.
///
/// Stored in Yrs as `{ "type": kind, "children": [{ "text": .. }, ..] }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentNode {
    pub kind: String,
    pub children: Vec<TextLeaf>,
}

impl ContentNode {
    pub fn paragraph(text: impl Into<String>) -> Self {
        Self {
            kind: "paragraph".to_string(),
            children: vec![TextLeaf { text: text.into() }],
        }
    }

    /// Concatenated text of every leaf.
    pub fn text(&self) -> String {
        self.children.iter().map(|leaf| leaf.text.as_str()).collect()
    }

    pub fn to_any(&self) -> Any {
        let children: Vec<Any> = self
            .children
            .iter()
            .map(|leaf| {
                let mut map = HashMap::new();
                map.insert("text".to_string(), Any::String(leaf.text.as_str().into()));
                Any::Map(Arc::new(map))
            })
            .collect();

        let mut map = HashMap::new();
        map.insert("type".to_string(), Any::String(self.kind.as_str().into()));
        map.insert("children".to_string(), Any::Array(children.into()));
        Any::Map(Arc::new(map))
    }

    /// Parse a stored node. Unknown shapes yield `None`.
    pub fn from_any(value: &Any) -> Option<Self> {
        let Any::Map(map) = value else {
            return None;
        };
        let Some(Any::String(kind)) = map.get("type") else {
            return None;
        };
        let children = match map.get("children") {
            Some(Any::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Any::Map(leaf) => match leaf.get("text") {
                        Some(Any::String(text)) => Some(TextLeaf {
                            text: text.to_string(),
                        }),
                        _ => None,
                    },
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        Some(Self {
            kind: kind.to_string(),
            children,
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

struct Handles {
    doc: Doc,
    content: ArrayRef,
    transport: Arc<dyn Transport>,
    persistence: LocalPersistence,
}

/// Live resources of one open document.
pub struct DocumentSession {
    document_id: String,
    seed_text: String,
    handles: Mutex<Option<Handles>>,
}

impl DocumentSession {
    fn open(
        document_id: &str,
        transports: &dyn TransportFactory,
        store: Arc<dyn UpdateStore>,
        config: &SessionConfig,
    ) -> Result<Self> {
        let doc = Doc::new();
        let content = doc.get_or_insert_array(config.content_name.as_str());
        // Restore before any peer traffic can reach the document.
        let persistence =
            LocalPersistence::bind(document_id, &doc, store, config.compaction_threshold)?;
        let transport = match transports.open(document_id, &doc) {
            Ok(transport) => transport,
            Err(e) => {
                persistence.destroy();
                return Err(e.into());
            }
        };

        log::info!(
            "Opened session for {document_id} (client {})",
            transport.client_id()
        );
        Ok(Self {
            document_id: document_id.to_owned(),
            seed_text: config.seed_text.clone(),
            handles: Mutex::new(Some(Handles {
                doc,
                content,
                transport,
                persistence,
            })),
        })
    }

    fn with_handles<T>(&self, f: impl FnOnce(&Handles) -> T) -> Result<T> {
        match lock(&self.handles).as_ref() {
            Some(handles) => Ok(f(handles)),
            None => Err(CollabError::SessionDestroyed(self.document_id.clone())),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.handles).is_none()
    }

    pub fn doc(&self) -> Result<Doc> {
        self.with_handles(|h| h.doc.clone())
    }

    pub fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.with_handles(|h| h.transport.clone())
    }

    pub fn awareness(&self) -> Result<Arc<Awareness>> {
        self.with_handles(|h| h.transport.awareness().clone())
    }

    pub fn client_id(&self) -> Result<ClientId> {
        self.with_handles(|h| h.transport.client_id())
    }

    /// Number of stored updates restored when the session opened.
    pub fn restored_updates(&self) -> Result<usize> {
        self.with_handles(|h| h.persistence.restored())
    }

    fn content(&self) -> Result<(Doc, ArrayRef)> {
        self.with_handles(|h| (h.doc.clone(), h.content.clone()))
    }

    pub fn content_len(&self) -> Result<u32> {
        let (doc, content) = self.content()?;
        let txn = doc.transact();
        Ok(content.len(&txn))
    }

    /// Decode the shared content array. Elements that are not content
    /// nodes are skipped.
    pub fn read_content(&self) -> Result<Vec<ContentNode>> {
        let (doc, content) = self.content()?;
        let txn = doc.transact();
        let nodes = match content.to_json(&txn) {
            Any::Array(items) => items.iter().filter_map(ContentNode::from_any).collect(),
            _ => Vec::new(),
        };
        Ok(nodes)
    }

    /// Append nodes in a single transaction.
    pub fn push_content(&self, nodes: &[ContentNode]) -> Result<()> {
        let (doc, content) = self.content()?;
        let mut txn = doc.transact_mut();
        for node in nodes {
            content.push_back(&mut txn, node.to_any());
        }
        Ok(())
    }

    /// Insert the default paragraph if the content array is empty. The
    /// check and the insert share one transaction. Returns whether a node
    /// was inserted.
    pub fn seed_if_empty(&self) -> Result<bool> {
        let (doc, content) = self.content()?;
        let mut txn = doc.transact_mut();
        if content.len(&txn) > 0 {
            return Ok(false);
        }
        content.push_back(&mut txn, ContentNode::paragraph(self.seed_text.as_str()).to_any());
        Ok(true)
    }

    /// Release transport, persistence and document. Returns `false` when
    /// the session was already destroyed.
    fn destroy(&self) -> bool {
        let Some(handles) = lock(&self.handles).take() else {
            return false;
        };
        handles.transport.destroy();
        handles.persistence.destroy();
        drop(handles);
        log::info!("Closed session for {}", self.document_id);
        true
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("document_id", &self.document_id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Binder
// ───────────────────────────────────────────────────────────────────

/// Creates, memoizes and destroys [`DocumentSession`]s.
pub struct SessionBinder {
    transports: Arc<dyn TransportFactory>,
    store: Arc<dyn UpdateStore>,
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Arc<DocumentSession>>>,
}

impl SessionBinder {
    pub fn new(
        transports: Arc<dyn TransportFactory>,
        store: Arc<dyn UpdateStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            transports,
            store,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session for `document_id`, created on first use. Binding the same id
    /// again returns the same session until it is unbound.
    pub fn bind(&self, document_id: &str) -> Result<Arc<DocumentSession>> {
        if document_id.trim().is_empty() {
            return Err(CollabError::InvalidDocumentId(document_id.to_owned()));
        }

        let mut sessions = lock(&self.sessions);
        if let Some(session) = sessions.get(document_id) {
            if !session.is_destroyed() {
                return Ok(session.clone());
            }
        }

        let session = Arc::new(DocumentSession::open(
            document_id,
            self.transports.as_ref(),
            self.store.clone(),
            &self.config,
        )?);
        sessions.insert(document_id.to_owned(), session.clone());
        Ok(session)
    }

    /// Currently bound session for `document_id`, if any.
    pub fn get(&self, document_id: &str) -> Option<Arc<DocumentSession>> {
        lock(&self.sessions).get(document_id).cloned()
    }

    pub fn bound_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Destroy `session` and forget it. Only the first call does anything;
    /// later calls return `false`.
    pub fn unbind(&self, session: &Arc<DocumentSession>) -> bool {
        {
            let mut sessions = lock(&self.sessions);
            if sessions
                .get(session.document_id())
                .is_some_and(|bound| Arc::ptr_eq(bound, session))
            {
                sessions.remove(session.document_id());
            }
        }

        let destroyed = session.destroy();
        if !destroyed {
            log::warn!("Session for {} was already unbound", session.document_id());
        }
        destroyed
    }
}

impl std::fmt::Debug for SessionBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBinder")
            .field("config", &self.config)
            .field("sessions", &lock(&self.sessions).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::transport::{MemoryHub, TransportError};

    fn binder() -> SessionBinder {
        let hub = MemoryHub::new();
        SessionBinder::new(
            Arc::new(hub.factory()),
            Arc::new(MemoryStore::new()),
            SessionConfig::for_testing(),
        )
    }

    struct FailingFactory;

    impl TransportFactory for FailingFactory {
        fn open(&self, _: &str, _: &Doc) -> std::result::Result<Arc<dyn Transport>, TransportError> {
            Err(TransportError::Unreachable)
        }
    }

    // ── Content nodes ───────────────────────────────────────

    #[test]
    fn test_content_node_any_roundtrip() {
        let node = ContentNode::paragraph("New Value!");
        assert_eq!(ContentNode::from_any(&node.to_any()), Some(node));
    }

    #[test]
    fn test_foreign_any_is_not_a_node() {
        assert_eq!(ContentNode::from_any(&Any::Bool(true)), None);
        assert_eq!(ContentNode::from_any(&Any::Map(Arc::new(HashMap::new()))), None);
    }

    // ── Binding ─────────────────────────────────────────────

    #[test]
    fn test_bind_is_memoized() {
        let binder = binder();
        let a = binder.bind("doc-1").unwrap();
        let b = binder.bind("doc-1").unwrap();
        let other = binder.bind("doc-2").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
        assert_ne!(a.client_id().unwrap(), other.client_id().unwrap());
        assert_eq!(binder.bound_documents(), vec!["doc-1", "doc-2"]);
    }

    #[test]
    fn test_empty_document_id_rejected() {
        let binder = binder();
        assert!(matches!(binder.bind(""), Err(CollabError::InvalidDocumentId(_))));
        assert!(matches!(binder.bind("  "), Err(CollabError::InvalidDocumentId(_))));
    }

    #[test]
    fn test_unbind_exactly_once() {
        let binder = binder();
        let session = binder.bind("doc-1").unwrap();
        let transport = session.transport().unwrap();

        assert!(binder.unbind(&session));
        assert!(!binder.unbind(&session));
        assert!(session.is_destroyed());
        assert!(binder.get("doc-1").is_none());
        assert!(matches!(session.doc(), Err(CollabError::SessionDestroyed(_))));
        assert!(matches!(session.read_content(), Err(CollabError::SessionDestroyed(_))));
        assert!(transport.connect().is_err());
    }

    #[test]
    fn test_rebind_after_unbind_creates_fresh_session() {
        let binder = binder();
        let first = binder.bind("doc-1").unwrap();
        binder.unbind(&first);

        let second = binder.bind("doc-1").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_destroyed());
    }

    #[test]
    fn test_transport_failure_surfaces_from_bind() {
        let binder = SessionBinder::new(
            Arc::new(FailingFactory),
            Arc::new(MemoryStore::new()),
            SessionConfig::default(),
        );
        assert!(matches!(
            binder.bind("doc-1"),
            Err(CollabError::Transport(TransportError::Unreachable))
        ));
        assert!(binder.bound_documents().is_empty());
    }

    // ── Content ─────────────────────────────────────────────

    #[test]
    fn test_seed_if_empty_inserts_once() {
        let binder = binder();
        let session = binder.bind("doc-1").unwrap();

        assert!(session.seed_if_empty().unwrap());
        assert!(!session.seed_if_empty().unwrap());
        assert_eq!(session.read_content().unwrap(), vec![ContentNode::paragraph("New Value!")]);
    }

    #[test]
    fn test_content_survives_rebind_through_store() {
        let binder = binder();
        let session = binder.bind("doc-1").unwrap();
        session
            .push_content(&[ContentNode::paragraph("one"), ContentNode::paragraph("two")])
            .unwrap();
        binder.unbind(&session);

        let reopened = binder.bind("doc-1").unwrap();
        assert_eq!(reopened.content_len().unwrap(), 2);
        assert_eq!(reopened.read_content().unwrap()[1].text(), "two");
        assert!(reopened.restored_updates().unwrap() > 0);
    }
}
