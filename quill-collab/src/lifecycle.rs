//! Connection lifecycle of an open document.
//!
//! ```text
//!   Idle ──start()──► Connecting ──► Connected ◄──► Disconnected
//!                          │                              ▲
//!                          └──── connect() failed ────────┘
//!
//!   any phase ──teardown()──► TornDown   (terminal)
//! ```
//!
//! `online` mirrors the transport status: true exactly while the last status
//! event was `Connected`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::Result;
use crate::events::Subscription;
use crate::identity::PresenceState;
use crate::session::DocumentSession;
use crate::transport::{StatusEvent, Transport, TransportStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    TornDown,
}

#[derive(Debug)]
struct ControllerState {
    phase: ConnectionPhase,
    online: bool,
}

impl ControllerState {
    fn apply(&mut self, status: TransportStatus) {
        if self.phase == ConnectionPhase::TornDown {
            return;
        }
        self.phase = match status {
            TransportStatus::Connecting => ConnectionPhase::Connecting,
            TransportStatus::Connected => ConnectionPhase::Connected,
            TransportStatus::Disconnected => ConnectionPhase::Disconnected,
        };
        self.online = status == TransportStatus::Connected;
    }
}

fn lock(state: &Mutex<ControllerState>) -> MutexGuard<'_, ControllerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives the transport of one session from start to teardown.
pub struct ConnectionController {
    document_id: String,
    state: Arc<Mutex<ControllerState>>,
    transport: Arc<dyn Transport>,
    subscription: Option<Subscription>,
}

impl ConnectionController {
    /// Subscribe to status changes, announce `presence`, then connect.
    ///
    /// A failed connection attempt leaves the controller offline; it is
    /// logged, not returned. Only a destroyed session is an error.
    pub fn start(session: &DocumentSession, presence: &PresenceState) -> Result<Self> {
        let transport = session.transport()?;
        let state = Arc::new(Mutex::new(ControllerState {
            phase: ConnectionPhase::Idle,
            online: false,
        }));

        let sink = state.clone();
        let document_id = session.document_id().to_owned();
        let subscription = transport.status_events().subscribe(move |event: &StatusEvent| {
            log::debug!("{document_id}: status {}", event.status);
            lock(&sink).apply(event.status);
        });

        transport.awareness().set_local_state(Some(presence.clone()));

        log::info!("Connecting {}...", session.document_id());
        if let Err(e) = transport.connect() {
            log::warn!("Connection for {} failed, staying offline: {e}", session.document_id());
            lock(&state).apply(TransportStatus::Disconnected);
        }

        Ok(Self {
            document_id: session.document_id().to_owned(),
            state,
            transport,
            subscription: Some(subscription),
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn phase(&self) -> ConnectionPhase {
        lock(&self.state).phase
    }

    pub fn is_online(&self) -> bool {
        lock(&self.state).online
    }

    /// Detach from status events, disconnect, and stop for good.
    pub fn teardown(&mut self) {
        {
            let state = lock(&self.state);
            if state.phase == ConnectionPhase::TornDown {
                return;
            }
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }

        log::info!("Disconnecting {}", self.document_id);
        self.transport.disconnect();

        let mut state = lock(&self.state);
        state.phase = ConnectionPhase::TornDown;
        state.online = false;
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ConnectionController")
            .field("document_id", &self.document_id)
            .field("phase", &state.phase)
            .field("online", &state.online)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::identity::CursorColor;
    use crate::session::SessionBinder;
    use crate::storage::MemoryStore;
    use crate::transport::MemoryHub;

    fn presence() -> PresenceState {
        PresenceState::new("Ada", "https://example.test/a.jpg", CursorColor::default())
    }

    fn binder(hub: &MemoryHub) -> SessionBinder {
        SessionBinder::new(
            Arc::new(hub.factory()),
            Arc::new(MemoryStore::new()),
            SessionConfig::for_testing(),
        )
    }

    #[test]
    fn test_start_connects_and_publishes_presence() {
        let hub = MemoryHub::new();
        let binder = binder(&hub);
        let session = binder.bind("doc").unwrap();

        let controller = ConnectionController::start(&session, &presence()).unwrap();

        assert_eq!(controller.phase(), ConnectionPhase::Connected);
        assert!(controller.is_online());
        assert_eq!(session.awareness().unwrap().local_state(), Some(presence()));
    }

    #[test]
    fn test_failed_connect_stays_offline() {
        let hub = MemoryHub::new();
        hub.set_reachable(false);
        let binder = binder(&hub);
        let session = binder.bind("doc").unwrap();

        let controller = ConnectionController::start(&session, &presence()).unwrap();

        assert_eq!(controller.phase(), ConnectionPhase::Disconnected);
        assert!(!controller.is_online());
    }

    #[test]
    fn test_status_events_toggle_online() {
        let hub = MemoryHub::new();
        let binder = binder(&hub);
        let session = binder.bind("doc").unwrap();
        let controller = ConnectionController::start(&session, &presence()).unwrap();
        let transport = session.transport().unwrap();

        transport.disconnect();
        assert!(!controller.is_online());
        assert_eq!(controller.phase(), ConnectionPhase::Disconnected);

        transport.connect().unwrap();
        assert!(controller.is_online());
    }

    #[test]
    fn test_teardown_is_terminal_and_idempotent() {
        let hub = MemoryHub::new();
        let binder = binder(&hub);
        let session = binder.bind("doc").unwrap();
        let mut controller = ConnectionController::start(&session, &presence()).unwrap();
        let transport = session.transport().unwrap();

        controller.teardown();
        controller.teardown();

        assert_eq!(controller.phase(), ConnectionPhase::TornDown);
        assert_eq!(transport.status(), TransportStatus::Disconnected);
        assert_eq!(transport.status_events().handler_count(), 0);

        // Late events reach nobody.
        transport.status_events().emit(&StatusEvent {
            status: TransportStatus::Connected,
        });
        assert_eq!(controller.phase(), ConnectionPhase::TornDown);
        assert!(!controller.is_online());
    }

    #[test]
    fn test_start_on_destroyed_session_fails() {
        let hub = MemoryHub::new();
        let binder = binder(&hub);
        let session = binder.bind("doc").unwrap();
        binder.unbind(&session);

        assert!(ConnectionController::start(&session, &presence()).is_err());
    }
}
