//! Client facade.
//!
//! Thin composition over the [`ConnectionStateMachine`]: every call is
//! validated, checked against the connection state and then handed to the
//! component that owns it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bayeux_client::{Callback, CallbackResult, Client, Message};
//!
//! # async fn example() -> bayeux_client::Result<()> {
//! let client = Client::builder("https://push.example.com/faye").build()?;
//! client.connect().await?;
//!
//! let on_chat: Callback = Arc::new(|message: &Message| -> CallbackResult {
//!     println!("{:?}", message.data);
//!     Ok(())
//! });
//! client.subscribe("/chat/*", on_chat).await?;
//! client.publish("/chat/lobby", serde_json::json!({"text": "hi"})).await?;
//!
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::extension::Extension;
use crate::identifiers::ClientId;
use crate::protocol::{Channel, Message};
use crate::transport::{TransportInfo, TransportRegistry};

use super::builder::ClientBuilder;
use super::connection::ConnectionStateMachine;
use super::events::ClientEvent;
use super::options::ClientOptions;
use super::state::ConnectionState;
use super::subscriptions::{Callback, SubscriptionInfo};

// ============================================================================
// Client
// ============================================================================

/// Bayeux client.
///
/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ConnectionStateMachine>,
}

// ============================================================================
// Client - Constructor
// ============================================================================

impl Client {
    /// Creates a configuration builder for the server at `url`.
    #[inline]
    #[must_use]
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    pub(crate) fn new(
        url: Url,
        options: ClientOptions,
        registry: TransportRegistry,
        extensions: Vec<Arc<dyn Extension>>,
    ) -> Result<Self> {
        let inner = ConnectionStateMachine::new(url, options, registry, extensions)?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

// ============================================================================
// Client - Lifecycle
// ============================================================================

impl Client {
    /// Handshakes and starts the connect cycle.
    ///
    /// Concurrent calls share one handshake. Resolves once the first
    /// handshake succeeds or the session gives up.
    ///
    /// # Errors
    ///
    /// - [`Error::FatalConnection`] if handshake attempts are exhausted or
    ///   the server advised against reconnecting
    /// - [`Error::NotConnected`] if [`disconnect`](Self::disconnect) was
    ///   called meanwhile
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Stops background work, notifies the server and returns to
    /// Unconnected.
    ///
    /// Subscriptions are kept and replayed on the next
    /// [`connect`](Self::connect).
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }
}

// ============================================================================
// Client - Messaging
// ============================================================================

impl Client {
    /// Registers `callback` for deliveries matching `channel`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidChannel`] for malformed, meta or service channels
    /// - [`Error::NotConnected`] outside Connected and Reconnecting
    /// - [`Error::SubscriptionRejected`] if the server refuses the pattern
    pub async fn subscribe(&self, channel: &str, callback: Callback) -> Result<()> {
        self.inner.subscriptions.subscribe(channel, callback).await
    }

    /// Removes `callback` from `channel`.
    ///
    /// The server is only told once the last callback is gone.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidChannel`] for malformed channels
    /// - [`Error::SubscriptionRejected`] if the server refuses
    pub async fn unsubscribe(&self, channel: &str, callback: &Callback) -> Result<()> {
        self.inner.subscriptions.unsubscribe(channel, callback).await
    }

    /// Publishes `data` to `channel`.
    ///
    /// Never queued: fails immediately unless the session accepts requests.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidChannel`] for wildcard, meta or service channels
    /// - [`Error::NotConnected`] outside Connected and Reconnecting
    /// - [`Error::Json`] if `data` cannot be serialized
    /// - [`Error::PublishRejected`] if the server answers unsuccessfully
    pub async fn publish(&self, channel: &str, data: impl Serialize) -> Result<()> {
        let channel = Channel::for_publish(channel)?;
        let client_id = self.inner.view().require_session()?;
        let data = serde_json::to_value(data)?;

        let reply = self
            .inner
            .batcher
            .submit(Message::publish(&channel, &client_id, data))
            .await?;

        if !reply.is_successful() {
            return Err(Error::publish_rejected(
                channel.as_str(),
                reply.failure_reason(),
            ));
        }

        debug!(channel = %channel, "Published");
        Ok(())
    }

    /// Appends an extension to the pipeline.
    ///
    /// Takes effect for the next message in each direction.
    pub fn add_extension(&self, extension: impl Extension + 'static) {
        self.inner.pipeline.add(Arc::new(extension));
    }
}

// ============================================================================
// Client - Introspection
// ============================================================================

impl Client {
    /// Returns the connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Returns the server-issued client id, if a handshake is valid.
    #[inline]
    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        self.inner.view().client_id()
    }

    /// Describes the active transport.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> Option<TransportInfo> {
        self.inner.manager.active_info()
    }

    /// Returns every pattern and its state, sorted by pattern.
    #[inline]
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.subscriptions.snapshot()
    }

    /// Subscribes to lifecycle events.
    ///
    /// Slow receivers lose the oldest events.
    #[inline]
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Returns the settings the client was built with.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("client_id", &self.client_id())
            .field("transport", &self.inner.manager.active_name())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
