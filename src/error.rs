//! Error types for the Bayeux client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use bayeux_client::{Client, Result};
//!
//! async fn example(client: &Client) -> Result<()> {
//!     client.connect().await?;
//!     client.publish("/chat/room", serde_json::json!({"text": "hi"})).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Transport | [`Error::Transport`], [`Error::TransportTimeout`], [`Error::TransportClosed`], [`Error::TransportsExhausted`], [`Error::WebSocket`], [`Error::Http`] |
//! | Protocol | [`Error::Protocol`], [`Error::Handshake`], [`Error::Json`] |
//! | Extension | [`Error::Extension`], [`Error::MessageDropped`], [`Error::Authentication`] |
//! | Subscription | [`Error::InvalidChannel`], [`Error::SubscriptionRejected`] |
//! | Connection | [`Error::NotConnected`], [`Error::FatalConnection`], [`Error::PublishRejected`] |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::client::ConnectionState;
use crate::transport::{LONG_POLLING, WEBSOCKET};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport failed to connect or send.
    #[error("Transport {transport} failed: {message}")]
    Transport {
        /// Connection type of the failing transport.
        transport: String,
        /// Description of the failure.
        message: String,
    },

    /// Transport request timed out.
    #[error("Transport {transport} timed out after {timeout_ms}ms")]
    TransportTimeout {
        /// Connection type of the failing transport.
        transport: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Transport closed unexpectedly or was used after close.
    #[error("Transport {transport} is closed")]
    TransportClosed {
        /// Connection type of the closed transport.
        transport: String,
    },

    /// Every candidate transport failed to connect.
    #[error("All transports failed: {attempted}")]
    TransportsExhausted {
        /// Summary of each attempt.
        attempted: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed or unexpected server response.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Server rejected the handshake.
    #[error("Handshake rejected: {message}")]
    Handshake {
        /// Reason given by the server.
        message: String,
    },

    // ========================================================================
    // Extension Errors
    // ========================================================================
    /// An extension hook failed.
    ///
    /// Isolated by the pipeline and reported as an event; never fatal.
    #[error("Extension {extension} failed: {message}")]
    Extension {
        /// Name of the failing extension.
        extension: String,
        /// Description of the failure.
        message: String,
    },

    /// An extension dropped the message.
    #[error("Message on {channel} dropped by extension")]
    MessageDropped {
        /// Channel of the dropped message.
        channel: String,
    },

    /// Server reported an authentication failure.
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Reason given by the server.
        message: String,
    },

    // ========================================================================
    // Subscription Errors
    // ========================================================================
    /// Channel name violates the Bayeux grammar or is reserved.
    #[error("Invalid channel '{channel}': {reason}")]
    InvalidChannel {
        /// The rejected channel.
        channel: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Server rejected a subscribe or unsubscribe.
    #[error("Subscription to {channel} rejected: {reason}")]
    SubscriptionRejected {
        /// The affected pattern.
        channel: String,
        /// Reason given by the server.
        reason: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Operation not permitted in the current connection state.
    #[error("Not connected (state: {state})")]
    NotConnected {
        /// State at the time of the call.
        state: ConnectionState,
    },

    /// Connection gave up: retries exhausted or server advised no reconnect.
    #[error("Fatal connection error: {reason}")]
    FatalConnection {
        /// Why the connection gave up.
        reason: String,
    },

    /// Server rejected a publish.
    #[error("Publish to {channel} rejected: {reason}")]
    PublishRejected {
        /// Target channel.
        channel: String,
        /// Reason given by the server.
        reason: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket handshake or stream error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP request or response error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            transport: transport.into(),
            message: message.into(),
        }
    }

    /// Creates a transport timeout error.
    #[inline]
    pub fn transport_timeout(transport: impl Into<String>, timeout_ms: u64) -> Self {
        Self::TransportTimeout {
            transport: transport.into(),
            timeout_ms,
        }
    }

    /// Creates a transport closed error.
    #[inline]
    pub fn transport_closed(transport: impl Into<String>) -> Self {
        Self::TransportClosed {
            transport: transport.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a handshake rejection error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates an extension error.
    #[inline]
    pub fn extension(extension: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extension {
            extension: extension.into(),
            message: message.into(),
        }
    }

    /// Creates a message dropped error.
    #[inline]
    pub fn message_dropped(channel: impl Into<String>) -> Self {
        Self::MessageDropped {
            channel: channel.into(),
        }
    }

    /// Creates an authentication error.
    #[inline]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Creates an invalid channel error.
    #[inline]
    pub fn invalid_channel(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidChannel {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Creates a subscription rejected error.
    #[inline]
    pub fn subscription_rejected(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SubscriptionRejected {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Creates a not connected error.
    #[inline]
    pub fn not_connected(state: ConnectionState) -> Self {
        Self::NotConnected { state }
    }

    /// Creates a fatal connection error.
    #[inline]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::FatalConnection {
            reason: reason.into(),
        }
    }

    /// Creates a publish rejected error.
    #[inline]
    pub fn publish_rejected(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PublishRejected {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Produces an equivalent error for another waiter of the same failure.
    ///
    /// Variants wrapping external errors are flattened to their message.
    #[must_use]
    pub(crate) fn replicate(&self) -> Self {
        match self {
            Self::Transport { transport, message } => Self::transport(transport, message),
            Self::TransportTimeout {
                transport,
                timeout_ms,
            } => Self::transport_timeout(transport, *timeout_ms),
            Self::TransportClosed { transport } => Self::transport_closed(transport),
            Self::TransportsExhausted { attempted } => Self::TransportsExhausted {
                attempted: attempted.clone(),
            },
            Self::NotConnected { state } => Self::not_connected(*state),
            Self::FatalConnection { reason } => Self::fatal(reason),
            Self::MessageDropped { channel } => Self::message_dropped(channel),
            Self::WebSocket(e) => Self::transport(WEBSOCKET, e.to_string()),
            Self::Http(e) => Self::transport(LONG_POLLING, e.to_string()),
            other => Self::protocol(other.to_string()),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TransportTimeout { .. })
    }

    /// Returns `true` if this is a transport-level failure.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::TransportTimeout { .. }
                | Self::TransportClosed { .. }
                | Self::TransportsExhausted { .. }
                | Self::WebSocket(_)
                | Self::Http(_)
        )
    }

    /// Returns `true` if the server response was malformed or refused.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::Handshake { .. } | Self::Json(_)
        )
    }

    /// Returns `true` if an extension failed or dropped the message.
    #[inline]
    #[must_use]
    pub fn is_extension_error(&self) -> bool {
        matches!(
            self,
            Self::Extension { .. } | Self::MessageDropped { .. } | Self::Authentication { .. }
        )
    }

    /// Returns `true` if a channel was invalid or a subscription refused.
    #[inline]
    #[must_use]
    pub fn is_subscription_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidChannel { .. } | Self::SubscriptionRejected { .. }
        )
    }

    /// Returns `true` if the connection has given up.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalConnection { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::transport("websocket", "connection refused");
        assert_eq!(
            err.to_string(),
            "Transport websocket failed: connection refused"
        );
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("missing url");
        assert_eq!(err.to_string(), "Configuration error: missing url");
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::transport_timeout("long-polling", 5000);
        let other_err = Error::transport("long-polling", "test");

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_transport_error() {
        assert!(Error::transport("websocket", "x").is_transport_error());
        assert!(Error::transport_closed("websocket").is_transport_error());
        assert!(Error::transport_timeout("websocket", 1).is_transport_error());
        assert!(!Error::protocol("x").is_transport_error());
    }

    #[test]
    fn test_subscription_errors() {
        assert!(Error::invalid_channel("/a//b", "empty").is_subscription_error());
        assert!(Error::subscription_rejected("/a", "403").is_subscription_error());
        assert!(!Error::publish_rejected("/a", "no").is_subscription_error());
    }

    #[test]
    fn test_not_connected_display() {
        let err = Error::not_connected(ConnectionState::Disconnected);
        assert_eq!(err.to_string(), "Not connected (state: disconnected)");
    }

    #[test]
    fn test_replicate_preserves_transport_variants() {
        let err = Error::transport_timeout("long-polling", 300);
        assert!(matches!(
            err.replicate(),
            Error::TransportTimeout { timeout_ms: 300, .. }
        ));

        let err = Error::config("x");
        assert!(err.replicate().is_protocol_error());
    }

    #[test]
    fn test_from_websocket_error() {
        let err: Error = WsError::ConnectionClosed.into();
        assert!(matches!(err, Error::WebSocket(_)));
        assert!(err.is_transport_error());
        assert!(matches!(
            err.replicate(),
            Error::Transport { ref transport, .. } if transport == WEBSOCKET
        ));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.is_protocol_error());
    }
}
