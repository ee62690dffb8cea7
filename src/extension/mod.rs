//! Message extensions.
//!
//! An [`Extension`] observes or rewrites every message in one or both
//! directions. Extensions are run by the [`ExtensionPipeline`]:
//!
//! | Direction | Order | Example |
//! |-----------|-------|---------|
//! | Outgoing | registration order (A, B) | A adds credentials, B logs |
//! | Incoming | reverse order (B, A) | B logs, A checks auth errors |
//!
//! Running incoming hooks in reverse gives stack semantics: the last
//! extension to touch a request is the first to see its reply.
//!
//! # Example
//!
//! ```ignore
//! use async_trait::async_trait;
//! use bayeux_client::{Disposition, Extension, Message, Result};
//!
//! struct Stamp;
//!
//! #[async_trait]
//! impl Extension for Stamp {
//!     fn name(&self) -> &str {
//!         "stamp"
//!     }
//!
//!     async fn outgoing(&self, message: &mut Message) -> Result<Disposition> {
//!         message.ext.insert("stamp".into(), serde_json::json!(1));
//!         Ok(Disposition::Continue)
//!     }
//! }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Token authentication.
pub mod authentication;

/// Message tracing.
pub mod logging;

/// Ordered hook execution with failure isolation.
pub mod pipeline;

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::Message;

// ============================================================================
// Re-exports
// ============================================================================

pub use authentication::AuthenticationExtension;
pub use logging::LoggingExtension;
pub use pipeline::ExtensionPipeline;

// ============================================================================
// Disposition
// ============================================================================

/// Outcome of a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Pass the (possibly modified) message on.
    Continue,
    /// Halt the chain and discard the message.
    Drop,
}

// ============================================================================
// Extension
// ============================================================================

/// Hook pair applied to every message.
///
/// Both hooks default to passing the message through unchanged. An `Err`
/// is isolated by the pipeline: the message continues as it was before the
/// hook ran.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Name used in logs and events.
    fn name(&self) -> &str;

    /// Called for every message before it is sent.
    async fn outgoing(&self, _message: &mut Message) -> Result<Disposition> {
        Ok(Disposition::Continue)
    }

    /// Called for every message received from the server.
    async fn incoming(&self, _message: &mut Message) -> Result<Disposition> {
        Ok(Disposition::Continue)
    }
}
