//! Bayeux protocol message types.
//!
//! This module defines the wire format exchanged with a Bayeux server and
//! the channel grammar that every outgoing message is checked against.
//!
//! # Protocol Overview
//!
//! | Channel | Request | Reply adds |
//! |---------|---------|------------|
//! | `/meta/handshake` | `version`, `supportedConnectionTypes` | `clientId`, `successful`, `advice` |
//! | `/meta/connect` | `clientId`, `connectionType` | `successful`, `advice` |
//! | `/meta/subscribe` | `clientId`, `subscription` | `successful`, `error` |
//! | `/meta/unsubscribe` | `clientId`, `subscription` | `successful`, `error` |
//! | `/meta/disconnect` | `clientId` | `successful` |
//! | application | `clientId`, `data`, `id` | `successful` |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `channel` | Channel validation and wildcard matching |
//! | `message` | Message, advice and batch codec |

// ============================================================================
// Submodules
// ============================================================================

/// Channel validation and wildcard matching.
pub mod channel;

/// Message, advice and batch codec.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::{Channel, meta};
pub use message::{
    Advice, BAYEUX_VERSION, BayeuxError, ErrorKind, MINIMUM_VERSION, Message, Reconnect,
    decode_batch, decode_value, encode_batch,
};
