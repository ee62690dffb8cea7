//! Structured client events.
//!
//! Every state change, transport switch and isolated failure is broadcast as
//! a [`ClientEvent`]. Subscribers that fall behind lose the oldest events;
//! emission never blocks.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use tokio::sync::broadcast;

use super::state::ConnectionState;

// ============================================================================
// Direction
// ============================================================================

/// Which way a message was travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server.
    Outgoing,
    /// Server to client.
    Incoming,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outgoing => f.write_str("outgoing"),
            Self::Incoming => f.write_str("incoming"),
        }
    }
}

// ============================================================================
// ClientEvent
// ============================================================================

/// Observable client event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection state changed.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },

    /// A transport became active.
    TransportSwitched {
        /// Previously active transport, if any.
        from: Option<String>,
        /// Newly active transport.
        to: String,
    },

    /// A transport failed to connect or degraded.
    TransportFailed {
        /// Connection type.
        transport: String,
        /// Failure description.
        reason: String,
    },

    /// An extension hook failed; the message continued unchanged.
    ExtensionFailed {
        /// Extension name.
        extension: String,
        /// Hook direction.
        direction: Direction,
        /// Failure description.
        reason: String,
    },

    /// An extension dropped a message.
    MessageDropped {
        /// Channel of the dropped message.
        channel: String,
        /// Hook direction.
        direction: Direction,
    },

    /// A subscription callback failed.
    CallbackFailed {
        /// Channel of the delivered message.
        channel: String,
        /// Failure description.
        reason: String,
    },

    /// The server rejected a subscription during replay.
    SubscriptionFailed {
        /// Subscription pattern.
        channel: String,
        /// Reason given by the server.
        reason: String,
    },

    /// The connection gave up.
    Fatal {
        /// Why the connection gave up.
        reason: String,
    },
}

// ============================================================================
// EventSink
// ============================================================================

/// Broadcast sink shared by every component.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventSink {
    /// Creates a sink buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emits an event. Succeeds even when nobody listens.
    #[inline]
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }

    /// Returns a new receiver for subsequent events.
    #[inline]
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }
}

// ============================================================================
// Tests
// ============================================================================
