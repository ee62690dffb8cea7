//! HTTP long-polling transport.
//!
//! Each batch is one `POST` of a JSON array; the response body carries the
//! replies plus any deliveries the server had queued for this client.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::{Message, decode_batch};

use super::{
    InboundSender, LONG_POLLING, Transport, TransportInfo, TransportOptions, batch_ids,
    partition_replies,
};

// ============================================================================
// Types
// ============================================================================

/// State held between `connect` and `close`.
#[derive(Clone)]
struct Session {
    http: reqwest::Client,
    url: Url,
    inbound: InboundSender,
}

// ============================================================================
// LongPollingTransport
// ============================================================================

/// Request/response transport over HTTP POST.
pub struct LongPollingTransport {
    session: Mutex<Option<Session>>,
}

impl LongPollingTransport {
    /// Creates an unconnected transport.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
        }
    }

    fn live_session(&self) -> Result<Session> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| Error::transport_closed(LONG_POLLING))
    }
}

impl Default for LongPollingTransport {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Transport Implementation
// ============================================================================

#[async_trait]
impl Transport for LongPollingTransport {
    async fn connect(
        &self,
        url: &Url,
        options: &TransportOptions,
        inbound: InboundSender,
    ) -> Result<()> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::transport(
                LONG_POLLING,
                format!("unsupported scheme: {}", url.scheme()),
            ));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()?;

        debug!(url = %url, "Long-polling transport ready");

        *self.session.lock() = Some(Session {
            http,
            url: url.clone(),
            inbound,
        });
        Ok(())
    }

    async fn send_batch(&self, messages: Vec<Message>, timeout: Duration) -> Result<Vec<Message>> {
        let session = self.live_session()?;
        let sent = batch_ids(&messages);

        trace!(count = messages.len(), "POST batch");

        let response = session
            .http
            .post(session.url.clone())
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .json(&messages)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::transport_timeout(LONG_POLLING, timeout.as_millis() as u64)
                } else {
                    Error::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "Server returned error status");
            return Err(Error::transport(LONG_POLLING, format!("HTTP {status}")));
        }

        let body = response.text().await?;

        let (replies, rest) = partition_replies(&sent, decode_batch(&body)?);

        for message in rest {
            if session.inbound.send(message).is_err() {
                trace!("Inbound sink closed, message discarded");
            }
        }

        Ok(replies)
    }

    async fn close(&self) {
        if self.session.lock().take().is_some() {
            debug!("Long-polling transport closed");
        }
    }

    fn describe(&self) -> TransportInfo {
        TransportInfo {
            name: LONG_POLLING.to_string(),
            supports_batching: true,
            is_open: self.session.lock().is_some(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
