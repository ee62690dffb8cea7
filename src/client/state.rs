//! Connection state and its single owner.
//!
//! The state, the client id and the reason of the last fatal failure live
//! together in one [`SessionSnapshot`] published through a `watch` channel.
//! Only the connection state machine holds the [`StateCell`] that mutates it;
//! every other component reads through a [`StateView`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use tokio::sync::watch;
use tracing::info;

use crate::error::{Error, Result};
use crate::identifiers::ClientId;

use super::events::{ClientEvent, EventSink};

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Never connected, or explicitly disconnected.
    #[default]
    Unconnected,
    /// Handshake in progress (including retries).
    Handshaking,
    /// Handshake complete, `/meta/connect` cycling.
    Connected,
    /// `/meta/connect` failed; client id still held.
    Reconnecting,
    /// Gave up after a fatal error.
    Disconnected,
}

impl ConnectionState {
    /// Returns `true` if the client id is valid in this state.
    #[inline]
    #[must_use]
    pub const fn accepts_requests(self) -> bool {
        matches!(self, Self::Connected | Self::Reconnecting)
    }

    /// Returns `true` if no background work runs in this state.
    #[inline]
    #[must_use]
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Unconnected | Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconnected => "unconnected",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

// ============================================================================
// SessionSnapshot
// ============================================================================

/// Point-in-time view of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Server-issued id, present while a handshake is valid.
    pub client_id: Option<ClientId>,
    /// Reason of the last fatal failure.
    pub fatal_reason: Option<String>,
}

// ============================================================================
// StateView
// ============================================================================

/// Read-only handle to the session state.
#[derive(Debug, Clone)]
pub struct StateView {
    rx: watch::Receiver<SessionSnapshot>,
}

impl StateView {
    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.rx.borrow().state
    }

    /// Returns the current client id.
    #[inline]
    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        self.rx.borrow().client_id.clone()
    }

    /// Returns the full snapshot.
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.rx.borrow().clone()
    }

    /// Returns the client id if the state accepts requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] otherwise.
    pub fn require_session(&self) -> Result<ClientId> {
        let snapshot = self.rx.borrow();
        match (&snapshot.client_id, snapshot.state.accepts_requests()) {
            (Some(client_id), true) => Ok(client_id.clone()),
            _ => Err(Error::not_connected(snapshot.state)),
        }
    }

    /// Waits until the handshake outcome is known.
    ///
    /// Resolves on Connected, Disconnected or Unconnected.
    pub async fn settled(&self) -> SessionSnapshot {
        let mut rx = self.rx.clone();
        let result = rx
            .wait_for(|s| {
                matches!(
                    s.state,
                    ConnectionState::Connected
                        | ConnectionState::Disconnected
                        | ConnectionState::Unconnected
                )
            })
            .await
            .map(|s| s.clone());

        // The cell outlives every view, so the channel only closes on teardown.
        result.unwrap_or_else(|_| SessionSnapshot {
            state: ConnectionState::Unconnected,
            ..Default::default()
        })
    }
}

// ============================================================================
// StateCell
// ============================================================================

/// Exclusive writer of the session state.
pub(crate) struct StateCell {
    tx: watch::Sender<SessionSnapshot>,
    events: EventSink,
}

impl StateCell {
    pub(crate) fn new(events: EventSink) -> Self {
        let (tx, _) = watch::channel(SessionSnapshot::default());
        Self { tx, events }
    }

    pub(crate) fn view(&self) -> StateView {
        StateView {
            rx: self.tx.subscribe(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.tx.borrow().state
    }

    pub(crate) fn client_id(&self) -> Option<ClientId> {
        self.tx.borrow().client_id.clone()
    }

    /// Moves to `to`, emitting an event if the state changed.
    pub(crate) fn transition(&self, to: ConnectionState) {
        let mut from = to;
        self.tx.send_if_modified(|s| {
            from = s.state;
            s.state = to;
            from != to
        });
        self.announce(from, to);
    }

    /// Claims the handshake if no session is running.
    ///
    /// Returns `false` if another caller already started one.
    pub(crate) fn begin_handshake(&self) -> bool {
        let mut from = ConnectionState::Handshaking;
        let claimed = self.tx.send_if_modified(|s| {
            if !s.state.is_idle() {
                return false;
            }
            from = s.state;
            s.state = ConnectionState::Handshaking;
            s.fatal_reason = None;
            true
        });
        if claimed {
            self.announce(from, ConnectionState::Handshaking);
        }
        claimed
    }

    pub(crate) fn set_client_id(&self, client_id: Option<ClientId>) {
        self.tx.send_modify(|s| s.client_id = client_id);
    }

    /// Stores a handshake result and moves to Connected.
    pub(crate) fn establish(&self, client_id: ClientId) {
        let mut from = ConnectionState::Connected;
        self.tx.send_modify(|s| {
            from = s.state;
            s.client_id = Some(client_id);
            s.state = ConnectionState::Connected;
        });
        self.announce(from, ConnectionState::Connected);
    }

    /// Moves to Disconnected, recording `reason`.
    pub(crate) fn fail(&self, reason: &str) {
        let mut from = ConnectionState::Disconnected;
        self.tx.send_modify(|s| {
            from = s.state;
            s.state = ConnectionState::Disconnected;
            s.client_id = None;
            s.fatal_reason = Some(reason.to_string());
        });
        self.announce(from, ConnectionState::Disconnected);
    }

    /// Moves to Unconnected and forgets the session.
    pub(crate) fn reset(&self) {
        let mut from = ConnectionState::Unconnected;
        self.tx.send_modify(|s| {
            from = s.state;
            s.state = ConnectionState::Unconnected;
            s.client_id = None;
        });
        self.announce(from, ConnectionState::Unconnected);
    }

    fn announce(&self, from: ConnectionState, to: ConnectionState) {
        if from != to {
            info!(%from, %to, "Connection state changed");
            self.events.emit(ClientEvent::StateChanged { from, to });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
