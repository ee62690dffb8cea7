//! Message tracing.

use async_trait::async_trait;
use tracing::{Level, debug, enabled, trace};

use crate::error::Result;
use crate::protocol::Message;

use super::{Disposition, Extension};

/// Traces every message in both directions.
///
/// Channel and id are logged at debug level; the full JSON body at trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExtension;

impl LoggingExtension {
    /// Creates the extension.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn log(direction: &str, message: &Message) {
        debug!(
            direction,
            channel = %message.channel,
            id = message.id.as_ref().map(|id| id.as_str()).unwrap_or("-"),
            successful = ?message.successful,
            "Bayeux message"
        );
        if enabled!(Level::TRACE)
            && let Ok(body) = serde_json::to_string(message)
        {
            trace!(direction, %body, "Bayeux message body");
        }
    }
}

#[async_trait]
impl Extension for LoggingExtension {
    fn name(&self) -> &str {
        "logging"
    }

    async fn outgoing(&self, message: &mut Message) -> Result<Disposition> {
        Self::log("outgoing", message);
        Ok(Disposition::Continue)
    }

    async fn incoming(&self, message: &mut Message) -> Result<Disposition> {
        Self::log("incoming", message);
        Ok(Disposition::Continue)
    }
}
