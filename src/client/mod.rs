//! Bayeux client and its session machinery.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Client`] | Public facade: connect, subscribe, publish |
//! | [`ClientBuilder`] | Fluent configuration builder |
//! | [`ClientOptions`] | Timeouts, retry and batching settings |
//! | [`ConnectionStateMachine`] | Handshake, connect cycle and recovery |
//! | [`SubscriptionManager`] | Pattern table, replay and dispatch |
//! | [`MessageBatcher`] | Coalesces outgoing requests |
//! | [`ClientEvent`] | Lifecycle events broadcast to observers |
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────────────┐
//!  Client ──────► │ ConnectionStateMachine │ ── owns ──► StateCell (sole writer)
//!                 └───────────┬────────────┘
//!          ┌──────────────────┼───────────────────┐
//!          ▼                  ▼                   ▼
//!  SubscriptionManager ─► MessageBatcher ─► Courier ─► ExtensionPipeline
//!          ▲                                      │
//!          │ deliveries                           ▼
//!     inbound task ◄──────────────────── TransportManager
//! ```
//!
//! Every component other than the state machine reads the session through a
//! [`StateView`].

// ============================================================================
// Submodules
// ============================================================================

/// Exponential retry delays.
pub mod backoff;

/// Outgoing request batching.
pub mod batcher;

/// Fluent builder for [`Client`].
pub mod builder;

/// Connection lifecycle.
pub mod connection;

/// Client facade.
pub mod core;

/// Request/reply exchange.
mod courier;

/// Lifecycle events.
pub mod events;

/// Client behavior settings.
pub mod options;

/// Connection state and its owner.
pub mod state;

/// Subscription tracking and dispatch.
pub mod subscriptions;

// ============================================================================
// Re-exports
// ============================================================================

pub use backoff::{Backoff, BackoffPolicy};
pub use batcher::MessageBatcher;
pub use builder::ClientBuilder;
pub use connection::ConnectionStateMachine;
pub use core::Client;
pub use events::{ClientEvent, Direction, EventSink};
pub use options::{BatchOptions, ClientOptions};
pub use state::{ConnectionState, SessionSnapshot, StateView};
pub use subscriptions::{
    Callback, CallbackResult, SubscriptionInfo, SubscriptionManager, SubscriptionState,
};
