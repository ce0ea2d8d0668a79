//! Collaborative editor facade.
//!
//! [`CollaborativeEditor`] wires the pieces together for one editor view:
//! it owns the local identity, keeps at most one document open, and exposes
//! the view model (`value`, remote peers, `online`) an editor renders.
//!
//! Switching documents is cancel-old-then-create-new: everything bound to
//! the previous document is torn down before the next one is bound.

use std::sync::Arc;

use crate::awareness::ClientId;
use crate::error::Result;
use crate::identity::PresenceState;
use crate::lifecycle::{ConnectionController, ConnectionPhase};
use crate::presence::{PeerAvatar, PeerEntry, PresenceTracker};
use crate::seed::SeedCoordinator;
use crate::session::{ContentNode, DocumentSession, SessionBinder};

/// Snapshot handed to the editor view.
#[derive(Debug, Clone, PartialEq)]
pub struct EditorView {
    pub document_id: Option<String>,
    pub value: Vec<ContentNode>,
    /// Remote peers only, sorted by client id
    pub peers: Vec<PeerEntry>,
    pub online: bool,
}

impl EditorView {
    /// Avatars to render; empty when nobody else is around.
    pub fn avatars(&self) -> Vec<PeerAvatar> {
        self.peers.iter().map(PeerAvatar::from_entry).collect()
    }

    pub fn show_avatars(&self) -> bool {
        !self.peers.is_empty()
    }
}

struct OpenDocument {
    session: Arc<DocumentSession>,
    local_id: ClientId,
    seed: SeedCoordinator,
    tracker: PresenceTracker,
    controller: ConnectionController,
}

/// One editor instance.
pub struct CollaborativeEditor {
    binder: Arc<SessionBinder>,
    presence: PresenceState,
    current: Option<OpenDocument>,
    value: Vec<ContentNode>,
}

impl CollaborativeEditor {
    /// Editor with a freshly generated identity.
    pub fn new(binder: Arc<SessionBinder>) -> Self {
        Self::with_presence(binder, PresenceState::random())
    }

    pub fn with_presence(binder: Arc<SessionBinder>, presence: PresenceState) -> Self {
        log::debug!("Editor identity: {} ({})", presence.name, presence.color);
        Self {
            binder,
            presence,
            current: None,
            value: Vec::new(),
        }
    }

    pub fn presence(&self) -> &PresenceState {
        &self.presence
    }

    pub fn document_id(&self) -> Option<&str> {
        self.current.as_ref().map(|open| open.session.document_id())
    }

    pub fn session(&self) -> Option<&Arc<DocumentSession>> {
        self.current.as_ref().map(|open| &open.session)
    }

    pub fn local_client_id(&self) -> Option<ClientId> {
        self.current.as_ref().map(|open| open.local_id)
    }

    /// Open `document_id`, closing the current document first. Opening the
    /// document that is already open does nothing.
    pub fn open(&mut self, document_id: &str) -> Result<()> {
        if self.document_id() == Some(document_id) {
            return Ok(());
        }
        self.close();

        let session = self.binder.bind(document_id)?;
        let opened = Self::attach(&session, &self.presence)
            .and_then(|open| Ok((session.read_content()?, open)));
        match opened {
            Ok((value, open)) => {
                self.value = value;
                self.current = Some(open);
                Ok(())
            }
            Err(e) => {
                self.binder.unbind(&session);
                Err(e)
            }
        }
    }

    fn attach(session: &Arc<DocumentSession>, presence: &PresenceState) -> Result<OpenDocument> {
        let local_id = session.client_id()?;
        let seed = SeedCoordinator::attach(session)?;
        let tracker = PresenceTracker::attach(&session.awareness()?);
        let controller = ConnectionController::start(session, presence)?;
        Ok(OpenDocument {
            session: session.clone(),
            local_id,
            seed,
            tracker,
            controller,
        })
    }

    /// Tear down the open document, if any.
    pub fn close(&mut self) {
        let Some(mut open) = self.current.take() else {
            return;
        };
        open.tracker.detach();
        open.seed.detach();
        open.controller.teardown();
        self.binder.unbind(&open.session);
        self.value.clear();
    }

    /// Store the value produced by the editor view.
    pub fn on_change(&mut self, value: Vec<ContentNode>) {
        self.value = value;
    }

    /// Refresh `value` from the shared content.
    pub fn load_value(&mut self) -> Result<()> {
        if let Some(open) = &self.current {
            self.value = open.session.read_content()?;
        }
        Ok(())
    }

    pub fn value(&self) -> &[ContentNode] {
        &self.value
    }

    pub fn is_online(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|open| open.controller.is_online())
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.current
            .as_ref()
            .map_or(ConnectionPhase::Idle, |open| open.controller.phase())
    }

    /// Remote peers only.
    pub fn peers(&self) -> Vec<PeerEntry> {
        self.current
            .as_ref()
            .map(|open| open.tracker.remote_peers(open.local_id))
            .unwrap_or_default()
    }

    /// Whether the open document was seeded by this editor.
    pub fn seeded(&self) -> bool {
        self.current.as_ref().is_some_and(|open| open.seed.seeded())
    }

    pub fn view(&self) -> EditorView {
        EditorView {
            document_id: self.document_id().map(str::to_owned),
            value: self.value.clone(),
            peers: self.peers(),
            online: self.is_online(),
        }
    }
}

impl Drop for CollaborativeEditor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CollaborativeEditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaborativeEditor")
            .field("document_id", &self.document_id())
            .field("presence", &self.presence.name)
            .field("online", &self.is_online())
            .finish()
    }
}
