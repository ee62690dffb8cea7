//! Transport layer.
//!
//! A [`Transport`] carries batches of Bayeux messages to the server and
//! hands back the replies. Two variants ship with the crate:
//!
//! | Connection type | Type | Carrier |
//! |-----------------|------|---------|
//! | `websocket` | [`WebSocketTransport`] | persistent socket, replies correlated by message id |
//! | `long-polling` | [`LongPollingTransport`] | one HTTP POST per batch |
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   send_batch    ┌─────────────┐
//! │ TransportManager │ ──────────────► │  Transport  │ ◄────► server
//! │  (selection,     │ ◄── replies ─── │  (active)   │
//! │   fallback,      │                 └──────┬──────┘
//! │   quality)       │                        │ deliveries
//! └──────────────────┘                        ▼
//!                                      InboundSender
//! ```
//!
//! Replies to a batch are returned from [`Transport::send_batch`]; any other
//! message the server sends (deliveries, unsolicited meta messages) is
//! pushed to the [`InboundSender`] given at connect time, in arrival order.

// ============================================================================
// Submodules
// ============================================================================

/// HTTP long-polling transport.
pub mod long_polling;

/// Candidate selection, fallback and quality monitoring.
pub mod manager;

/// WebSocket transport and its I/O loop.
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::MessageId;
use crate::protocol::Message;

// ============================================================================
// Re-exports
// ============================================================================

pub use long_polling::LongPollingTransport;
pub use manager::{QualityMonitor, QualityThresholds, TransportManager};
pub use websocket::WebSocketTransport;

// ============================================================================
// Constants
// ============================================================================

/// Connection type name of the WebSocket transport.
pub const WEBSOCKET: &str = "websocket";

/// Connection type name of the long-polling transport.
pub const LONG_POLLING: &str = "long-polling";

// ============================================================================
// Types
// ============================================================================

/// Sink for messages that are not replies to an outstanding batch.
pub type InboundSender = mpsc::UnboundedSender<Message>;

/// Constructor registered for a connection type.
pub type TransportFactory = Arc<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

// ============================================================================
// TransportInfo
// ============================================================================

/// Snapshot of a transport's identity and status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    /// Connection type name.
    pub name: String,
    /// Whether several messages can share one wire send.
    pub supports_batching: bool,
    /// Whether the transport is currently usable.
    pub is_open: bool,
}

// ============================================================================
// TransportOptions
// ============================================================================

/// Settings passed to [`Transport::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Upper bound for opening the underlying connection.
    pub connect_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Capability implemented by every transport variant.
///
/// Implementations use interior mutability so one instance can be shared
/// between the long-lived `/meta/connect` request and batched sends.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the transport.
    ///
    /// Messages that are not replies to a batch sent on this transport are
    /// pushed to `inbound`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the connection cannot be opened.
    async fn connect(
        &self,
        url: &Url,
        options: &TransportOptions,
        inbound: InboundSender,
    ) -> Result<()>;

    /// Sends one batch and returns the replies to it.
    ///
    /// `timeout` bounds the whole exchange; its expiry is reported as
    /// [`Error::TransportTimeout`].
    ///
    /// # Errors
    ///
    /// Returns a transport error on send failure, timeout or close.
    async fn send_batch(&self, messages: Vec<Message>, timeout: Duration) -> Result<Vec<Message>>;

    /// Closes the transport. Outstanding sends fail with
    /// [`Error::TransportClosed`].
    async fn close(&self);

    /// Describes the transport.
    fn describe(&self) -> TransportInfo;
}

// ============================================================================
// Reply Correlation
// ============================================================================

/// Splits a server batch into replies to `sent` and everything else.
///
/// A message is a reply if it carries the id of a sent request and is a
/// reply-shaped message; a delivery echoing a publish id is not.
pub(crate) fn partition_replies(
    sent: &FxHashSet<MessageId>,
    messages: Vec<Message>,
) -> (Vec<Message>, Vec<Message>) {
    messages.into_iter().partition(|message| {
        message.is_reply() && message.id.as_ref().is_some_and(|id| sent.contains(id))
    })
}

/// Collects the ids of a batch.
pub(crate) fn batch_ids(messages: &[Message]) -> FxHashSet<MessageId> {
    messages.iter().filter_map(|m| m.id.clone()).collect()
}

// ============================================================================
// TransportRegistry
// ============================================================================

/// Ordered set of transport constructors keyed by connection type.
///
/// Fixed at configuration time; the manager instantiates from it when it
/// selects a candidate.
#[derive(Clone)]
pub struct TransportRegistry {
    factories: Vec<(String, TransportFactory)>,
}

impl TransportRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Creates a registry with the WebSocket and long-polling transports.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::empty()
            .with(WEBSOCKET, || Box::new(WebSocketTransport::new()))
            .with(LONG_POLLING, || Box::new(LongPollingTransport::new()))
    }

    /// Registers (or replaces) the constructor for `name`.
    #[must_use]
    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Transport> + Send + Sync + 'static,
    {
        let name = name.into().to_ascii_lowercase();
        let factory: TransportFactory = Arc::new(factory);
        match self.factories.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = factory,
            None => self.factories.push((name, factory)),
        }
        self
    }

    /// Instantiates the transport registered for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if nothing is registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn Transport>> {
        self.factories
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, factory)| factory())
            .ok_or_else(|| Error::config(format!("no transport registered for '{name}'")))
    }

    /// Returns `true` if `name` is registered.
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Returns registered names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.factories.iter().map(|(n, _)| n.clone()).collect()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("names", &self.names())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
