//! Bayeux client - publish/subscribe over Faye-compatible servers.
//!
//! This library implements the client side of the Bayeux protocol: it
//! negotiates a transport, handshakes, keeps a `/meta/connect` cycle alive,
//! manages channel subscriptions and recovers from transport failures on
//! its own.
//!
//! # Architecture
//!
//! - **Connection state machine**: sole owner of the session state; runs
//!   handshake, connect cycle, backoff and re-handshake
//! - **Transport manager**: picks the first working transport in preference
//!   order and falls back when one degrades
//! - **Subscription manager**: survives reconnects by replaying every pattern
//!   after each handshake
//! - **Extension pipeline**: every message passes through registered
//!   extensions, in order outgoing and in reverse incoming
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bayeux_client::{Callback, CallbackResult, Client, Message, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::builder("https://push.example.com/faye").build()?;
//!     client.connect().await?;
//!
//!     let print: Callback = Arc::new(|message: &Message| -> CallbackResult {
//!         println!("{}: {:?}", message.channel, message.data);
//!         Ok(())
//!     });
//!     client.subscribe("/news/**", print).await?;
//!     client.publish("/news/rust", serde_json::json!({"title": "1.92"})).await?;
//!
//!     client.disconnect().await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Client`] facade, builder, options, session machinery |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`extension`] | [`Extension`] trait and shipped extensions |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Bayeux messages, advice and channel grammar |
//! | [`transport`] | WebSocket and long-polling transports, manager |

// ============================================================================
// Modules
// ============================================================================

/// Client facade and session machinery.
///
/// Use [`Client::builder()`] to create a configured client.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Message extensions.
pub mod extension;

/// Type-safe identifiers.
///
/// Newtype wrappers keep message ids and client ids apart.
pub mod identifiers;

/// Bayeux wire format and channel grammar.
pub mod protocol;

/// Transport layer.
///
/// The [`Transport`](transport::Transport) trait, its two variants and the
/// manager that selects between them.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{
    BackoffPolicy, BatchOptions, Callback, CallbackResult, Client, ClientBuilder, ClientEvent,
    ClientOptions, ConnectionState, Direction, SubscriptionInfo, SubscriptionState,
};

// Error types
pub use error::{Error, Result};

// Extension types
pub use extension::{AuthenticationExtension, Disposition, Extension, LoggingExtension};

// Identifier types
pub use identifiers::{ClientId, MessageId};

// Protocol types
pub use protocol::{Advice, Channel, Message, Reconnect};

// Transport types
pub use transport::{QualityThresholds, Transport, TransportInfo, TransportRegistry};
