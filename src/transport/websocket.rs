//! WebSocket transport and its I/O loop.
//!
//! One persistent socket carries every batch. Replies are correlated to
//! their request by message id; everything else the server pushes goes to
//! the inbound sink.
//!
//! # I/O Loop
//!
//! The transport spawns a tokio task that handles:
//!
//! - Outgoing batches from the manager
//! - Incoming frames (replies and deliveries)
//! - Reply correlation by message id
//! - Failing every outstanding request when the socket closes

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as Frame;
use tracing::{debug, error, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::MessageId;
use crate::protocol::{Message, decode_batch, encode_batch};

use super::{InboundSender, Transport, TransportInfo, TransportOptions, WEBSOCKET};

// ============================================================================
// Constants
// ============================================================================

/// Maximum outstanding replies before new batches are rejected.
const MAX_PENDING_REPLIES: usize = 1024;

// ============================================================================
// Types
// ============================================================================

/// Map of message IDs to reply channels.
type CorrelationMap = FxHashMap<MessageId, oneshot::Sender<Result<Message>>>;

// ============================================================================
// LinkCommand
// ============================================================================

/// Internal commands for the I/O loop.
enum LinkCommand {
    /// Write a frame and register its reply waiters.
    Send {
        frame: String,
        waiters: Vec<(MessageId, oneshot::Sender<Result<Message>>)>,
    },
    /// Remove timed-out correlation entries.
    RemoveCorrelation(Vec<MessageId>),
    /// Close the socket.
    Shutdown,
}

// ============================================================================
// Link
// ============================================================================

/// Handle to a running I/O loop.
#[derive(Clone)]
struct Link {
    command_tx: mpsc::UnboundedSender<LinkCommand>,
    correlation: Arc<Mutex<CorrelationMap>>,
}

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Persistent bidirectional transport.
///
/// A send failure or unexpected close is reported as a transport error and
/// never retried here; recovery belongs to the connection state machine.
pub struct WebSocketTransport {
    /// Running I/O loop, if connected.
    link: Mutex<Option<Link>>,
    /// Cleared by the I/O loop when the socket ends.
    open: Arc<AtomicBool>,
}

impl WebSocketTransport {
    /// Creates an unconnected transport.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            link: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Maps an `http(s)` endpoint to its `ws(s)` equivalent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for schemes other than http, https, ws, wss.
    pub fn socket_url(url: &Url) -> Result<Url> {
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(Error::config(format!(
                    "unsupported scheme for websocket: {other}"
                )));
            }
        };

        let mut mapped = url.clone();
        mapped
            .set_scheme(scheme)
            .map_err(|()| Error::config(format!("cannot map {url} to {scheme}")))?;
        Ok(mapped)
    }

    /// Starts the I/O loop over an established socket.
    pub(crate) fn attach<S>(&self, ws_stream: WebSocketStream<S>, inbound: InboundSender)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let correlation = Arc::new(Mutex::new(CorrelationMap::default()));

        self.open.store(true, Ordering::SeqCst);

        tokio::spawn(Self::run_io_loop(
            ws_stream,
            command_rx,
            Arc::clone(&correlation),
            inbound,
            Arc::clone(&self.open),
        ));

        *self.link.lock() = Some(Link {
            command_tx,
            correlation,
        });
    }

    /// Returns the live link or a closed error.
    fn live_link(&self) -> Result<Link> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::transport_closed(WEBSOCKET));
        }
        self.link
            .lock()
            .clone()
            .ok_or_else(|| Error::transport_closed(WEBSOCKET))
    }

    /// I/O loop that owns the socket.
    async fn run_io_loop<S>(
        ws_stream: WebSocketStream<S>,
        mut command_rx: mpsc::UnboundedReceiver<LinkCommand>,
        correlation: Arc<Mutex<CorrelationMap>>,
        inbound: InboundSender,
        open: Arc<AtomicBool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming frames from server
                frame = ws_read.next() => {
                    match frame {
                        Some(Ok(Frame::Text(text))) => {
                            Self::handle_incoming_frame(&text, &correlation, &inbound);
                        }

                        Some(Ok(Frame::Close(_))) => {
                            debug!("WebSocket closed by server");
                            break;
                        }

                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            break;
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            break;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                // Commands from the transport handle
                command = command_rx.recv() => {
                    match command {
                        Some(LinkCommand::Send { frame, waiters }) => {
                            let ids: Vec<MessageId> = waiters.iter().map(|(id, _)| id.clone()).collect();
                            correlation.lock().extend(waiters);

                            if let Err(e) = ws_write.send(Frame::Text(frame.into())).await {
                                warn!(error = %e, "Failed to write batch");
                                let failure = Error::from(e);
                                let mut map = correlation.lock();
                                for id in ids {
                                    if let Some(tx) = map.remove(&id) {
                                        let _ = tx.send(Err(failure.replicate()));
                                    }
                                }
                                break;
                            }

                            trace!("Batch written");
                        }

                        Some(LinkCommand::RemoveCorrelation(ids)) => {
                            let mut map = correlation.lock();
                            for id in &ids {
                                map.remove(id);
                            }
                            debug!(count = ids.len(), "Removed timed-out correlations");
                        }

                        Some(LinkCommand::Shutdown) => {
                            debug!("Shutdown command received");
                            let _ = ws_write.close().await;
                            break;
                        }

                        None => {
                            debug!("Command channel closed");
                            break;
                        }
                    }
                }
            }
        }

        open.store(false, Ordering::SeqCst);
        Self::fail_pending_replies(&correlation);

        debug!("WebSocket I/O loop terminated");
    }

    /// Routes an incoming text frame to waiters or the inbound sink.
    fn handle_incoming_frame(
        text: &str,
        correlation: &Arc<Mutex<CorrelationMap>>,
        inbound: &InboundSender,
    ) {
        let messages = match decode_batch(text) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "Failed to parse incoming frame");
                return;
            }
        };

        for message in messages {
            let waiter = match (&message.id, message.is_reply()) {
                (Some(id), true) => correlation.lock().remove(id),
                _ => None,
            };

            match waiter {
                Some(tx) => {
                    let _ = tx.send(Ok(message));
                }
                None => {
                    if inbound.send(message).is_err() {
                        trace!("Inbound sink closed, message discarded");
                    }
                }
            }
        }
    }

    /// Fails all outstanding replies with a closed error.
    fn fail_pending_replies(correlation: &Arc<Mutex<CorrelationMap>>) {
        let pending: Vec<_> = correlation.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::transport_closed(WEBSOCKET)));
        }

        if count > 0 {
            debug!(count, "Failed pending replies on close");
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Transport Implementation
// ============================================================================

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        url: &Url,
        options: &TransportOptions,
        inbound: InboundSender,
    ) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            return Ok(());
        }

        let socket_url = Self::socket_url(url)?;
        debug!(url = %socket_url, "Opening WebSocket");

        let (ws_stream, _) = timeout(
            options.connect_timeout,
            tokio_tungstenite::connect_async(socket_url.as_str()),
        )
        .await
        .map_err(|_| {
            Error::transport_timeout(WEBSOCKET, options.connect_timeout.as_millis() as u64)
        })??;

        self.attach(ws_stream, inbound);
        Ok(())
    }

    async fn send_batch(&self, messages: Vec<Message>, timeout_after: Duration) -> Result<Vec<Message>> {
        let link = self.live_link()?;

        {
            let pending = link.correlation.lock().len();
            if pending + messages.len() > MAX_PENDING_REPLIES {
                warn!(pending, max = MAX_PENDING_REPLIES, "Too many pending replies");
                return Err(Error::transport(
                    WEBSOCKET,
                    format!("too many pending replies: {pending}/{MAX_PENDING_REPLIES}"),
                ));
            }
        }

        let frame = encode_batch(&messages)?;
        let ids: Vec<MessageId> = messages.iter().filter_map(|m| m.id.clone()).collect();

        let mut waiters = Vec::with_capacity(ids.len());
        let mut receivers = Vec::with_capacity(ids.len());
        for id in &ids {
            let (tx, rx) = oneshot::channel();
            waiters.push((id.clone(), tx));
            receivers.push(rx);
        }

        link.command_tx
            .send(LinkCommand::Send { frame, waiters })
            .map_err(|_| Error::transport_closed(WEBSOCKET))?;

        match timeout(timeout_after, join_all(receivers)).await {
            Ok(results) => results
                .into_iter()
                .map(|received| received.map_err(|_| Error::transport_closed(WEBSOCKET))?)
                .collect(),
            Err(_) => {
                let _ = link.command_tx.send(LinkCommand::RemoveCorrelation(ids));
                Err(Error::transport_timeout(
                    WEBSOCKET,
                    timeout_after.as_millis() as u64,
                ))
            }
        }
    }

    async fn close(&self) {
        if let Some(link) = self.link.lock().take() {
            let _ = link.command_tx.send(LinkCommand::Shutdown);
        }
        self.open.store(false, Ordering::SeqCst);
    }

    fn describe(&self) -> TransportInfo {
        TransportInfo {
            name: WEBSOCKET.to_string(),
            supports_batching: true,
            is_open: self.open.load(Ordering::SeqCst),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::net::TcpListener;

    use crate::identifiers::ClientId;
    use crate::protocol::Channel;

    /// Accepts one socket and answers every request with a success reply,
    /// followed by a delivery on `/news`.
    async fn spawn_echo_server() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            while let Some(Ok(Frame::Text(text))) = ws.next().await {
                let requests = decode_batch(&text).unwrap();
                let mut out: Vec<Message> = requests
                    .into_iter()
                    .map(|m| Message {
                        successful: Some(true),
                        ..m
                    })
                    .collect();
                out.push(Message {
                    channel: "/news".to_string(),
                    data: Some(json!("hello")),
                    ..Default::default()
                });
                let frame = encode_batch(&out).unwrap();
                if ws.send(Frame::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        Url::parse(&format!("http://127.0.0.1:{port}/faye")).unwrap()
    }

    #[test]
    fn test_socket_url_mapping() {
        let http = Url::parse("http://example.com/faye").unwrap();
        let https = Url::parse("https://example.com/faye").unwrap();
        assert_eq!(WebSocketTransport::socket_url(&http).unwrap().as_str(), "ws://example.com/faye");
        assert_eq!(WebSocketTransport::socket_url(&https).unwrap().as_str(), "wss://example.com/faye");

        let ftp = Url::parse("ftp://example.com/").unwrap();
        assert!(WebSocketTransport::socket_url(&ftp).is_err());
    }

    #[tokio::test]
    async fn test_send_before_connect_is_closed() {
        let transport = WebSocketTransport::new();
        let err = transport
            .send_batch(Vec::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportClosed { .. }));
        assert!(!transport.describe().is_open);
    }

    #[tokio::test]
    async fn test_replies_correlated_and_deliveries_pushed() {
        let url = spawn_echo_server().await;
        let transport = WebSocketTransport::new();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();

        transport
            .connect(&url, &TransportOptions::default(), inbound_tx)
            .await
            .unwrap();
        assert!(transport.describe().is_open);

        let client_id = ClientId::from("c1");
        let first = Message::subscribe(&client_id, &Channel::parse("/news").unwrap());
        let second = Message::connect(&client_id, WEBSOCKET);
        let replies = transport
            .send_batch(vec![first.clone(), second.clone()], Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].id, first.id);
        assert_eq!(replies[1].id, second.id);

        let delivery = inbound_rx.recv().await.unwrap();
        assert_eq!(delivery.channel, "/news");

        transport.close().await;
        assert!(!transport.describe().is_open);
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("http://127.0.0.1:{port}/faye")).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = WebSocketTransport::new()
            .connect(&url, &TransportOptions::default(), tx)
            .await
            .unwrap_err();
        assert!(err.is_transport_error());
    }
}
