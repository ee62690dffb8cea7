//! In-memory Bayeux server and transports for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use url::Url;

use crate::client::{BackoffPolicy, BatchOptions, Callback, CallbackResult, Client, ClientOptions};
use crate::error::{Error, Result};
use crate::identifiers::ClientId;
use crate::protocol::channel::matches;
use crate::protocol::{Advice, BAYEUX_VERSION, Message, Reconnect, meta};

use super::{
    InboundSender, LONG_POLLING, Transport, TransportInfo, TransportOptions, TransportRegistry,
    WEBSOCKET,
};

// ============================================================================
// FakeServer
// ============================================================================

/// Scripted outcome of one `/meta/connect`.
#[derive(Debug, Clone)]
pub(crate) enum ConnectOutcome {
    /// Successful reply.
    Ok,
    /// Successful reply without advice.
    Quiet,
    /// The whole exchange fails at the transport level.
    Fail,
    /// Unsuccessful reply carrying `advice`.
    Reject(Advice),
}

struct ServerState {
    refused: FxHashSet<String>,
    failing: FxHashSet<String>,
    fail_sends: bool,
    fail_next_on: Vec<String>,
    subscribe_hold: Duration,
    supported: Vec<String>,
    client_id: String,
    version: String,
    handshake_advice: Advice,
    rejected_handshakes: u32,
    handshake_error: String,
    connect_script: VecDeque<ConnectOutcome>,
    connect_hold: Duration,
    rejected_subscriptions: FxHashMap<String, String>,
    rejected_publishes: FxHashMap<String, String>,
    subscriptions: Vec<String>,
    inbound: Option<InboundSender>,
    received: Vec<Message>,
    batch_sizes: Vec<usize>,
    handshakes: usize,
    connects: usize,
}

/// Shared handle to an in-memory server.
#[derive(Clone)]
pub(crate) struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                refused: FxHashSet::default(),
                failing: FxHashSet::default(),
                fail_sends: false,
                fail_next_on: Vec::new(),
                subscribe_hold: Duration::ZERO,
                supported: vec![WEBSOCKET.to_string(), LONG_POLLING.to_string()],
                client_id: "abc123".to_string(),
                version: BAYEUX_VERSION.to_string(),
                handshake_advice: Advice::new(Reconnect::Retry, 0, 20),
                rejected_handshakes: 0,
                handshake_error: String::new(),
                connect_script: VecDeque::new(),
                connect_hold: Duration::from_millis(20),
                rejected_subscriptions: FxHashMap::default(),
                rejected_publishes: FxHashMap::default(),
                subscriptions: Vec::new(),
                inbound: None,
                received: Vec::new(),
                batch_sizes: Vec::new(),
                handshakes: 0,
                connects: 0,
            })),
        }
    }

    /// Registry whose transports talk to this server.
    pub(crate) fn registry(&self) -> TransportRegistry {
        let ws = self.clone();
        let lp = self.clone();
        TransportRegistry::empty()
            .with(WEBSOCKET, move || Box::new(FakeTransport::new(WEBSOCKET, ws.clone())))
            .with(LONG_POLLING, move || {
                Box::new(FakeTransport::new(LONG_POLLING, lp.clone()))
            })
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub(crate) fn refuse_transport(&self, name: &str) {
        self.state.lock().refused.insert(name.to_string());
    }

    /// Makes every send on `name` fail while it stays open.
    pub(crate) fn fail_transport_sends(&self, name: &str) {
        self.state.lock().failing.insert(name.to_string());
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Fails the next batch carrying a message on `channel`.
    pub(crate) fn fail_next_batch_on(&self, channel: &str) {
        self.state.lock().fail_next_on.push(channel.to_string());
    }

    /// Delays every batch carrying a `/meta/subscribe`.
    pub(crate) fn hold_subscribes(&self, hold: Duration) {
        self.state.lock().subscribe_hold = hold;
    }

    pub(crate) fn set_supported(&self, types: &[&str]) {
        self.state.lock().supported = types.iter().map(|t| t.to_string()).collect();
    }

    pub(crate) fn set_version(&self, version: &str) {
        self.state.lock().version = version.to_string();
    }

    pub(crate) fn set_handshake_advice(&self, advice: Advice) {
        self.state.lock().handshake_advice = advice;
    }

    pub(crate) fn reject_handshakes(&self, count: u32, error: &str) {
        let mut state = self.state.lock();
        state.rejected_handshakes = count;
        state.handshake_error = error.to_string();
    }

    pub(crate) fn script_connects(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.state.lock().connect_script.extend(outcomes);
    }

    pub(crate) fn reject_subscription(&self, pattern: &str, error: &str) {
        self.state
            .lock()
            .rejected_subscriptions
            .insert(pattern.to_string(), error.to_string());
    }

    pub(crate) fn reject_publish(&self, channel: &str, error: &str) {
        self.state
            .lock()
            .rejected_publishes
            .insert(channel.to_string(), error.to_string());
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub(crate) fn received_on(&self, channel: &str) -> Vec<Message> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }

    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    pub(crate) fn handshake_count(&self) -> usize {
        self.state.lock().handshakes
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Pushes a delivery to the connected client.
    pub(crate) fn deliver(&self, channel: &str, data: Value) {
        let state = self.state.lock();
        if let Some(inbound) = &state.inbound {
            let _ = inbound.send(delivery(channel, data));
        }
    }

    // ------------------------------------------------------------------------
    // Exchange
    // ------------------------------------------------------------------------

    fn attach(&self, inbound: InboundSender) {
        self.state.lock().inbound = Some(inbound);
    }

    async fn exchange(&self, transport: &str, batch: Vec<Message>) -> Result<Vec<Message>> {
        let (replies, hold) = {
            let mut state = self.state.lock();
            if state.fail_sends || state.failing.contains(transport) {
                return Err(Error::transport(transport, "send failed"));
            }
            if let Some(index) = state
                .fail_next_on
                .iter()
                .position(|c| batch.iter().any(|m| m.channel == *c))
            {
                state.fail_next_on.remove(index);
                return Err(Error::transport(transport, "batch lost"));
            }

            state.batch_sizes.push(batch.len());
            state.received.extend(batch.iter().cloned());

            let mut replies = Vec::with_capacity(batch.len());
            let mut hold = None;
            for request in &batch {
                if request.channel == meta::CONNECT {
                    hold = Some(state.connect_hold);
                } else if request.channel == meta::SUBSCRIBE && !state.subscribe_hold.is_zero() {
                    hold = Some(state.subscribe_hold);
                }
                replies.push(state.respond(transport, request)?);
            }
            (replies, hold)
        };

        if let Some(hold) = hold {
            tokio::time::sleep(hold).await;
        }
        Ok(replies)
    }
}

impl ServerState {
    fn respond(&mut self, transport: &str, request: &Message) -> Result<Message> {
        let mut reply = Message {
            channel: request.channel.clone(),
            id: request.id.clone(),
            client_id: request.client_id.clone(),
            successful: Some(true),
            ..Default::default()
        };

        match request.channel.as_str() {
            meta::HANDSHAKE => {
                self.handshakes += 1;
                reply.advice = Some(self.handshake_advice);
                if self.rejected_handshakes > 0 {
                    self.rejected_handshakes -= 1;
                    return Ok(reject(reply, &self.handshake_error));
                }
                self.subscriptions.clear();
                reply.client_id = Some(ClientId::new(if self.handshakes == 1 {
                    self.client_id.clone()
                } else {
                    format!("{}-{}", self.client_id, self.handshakes)
                }));
                reply.version = Some(self.version.clone());
                reply.supported_connection_types = Some(self.supported.clone());
            }
            meta::CONNECT => {
                self.connects += 1;
                match self.connect_script.pop_front().unwrap_or(ConnectOutcome::Ok) {
                    ConnectOutcome::Ok => {
                        reply.advice = Some(Advice {
                            reconnect: Some(Reconnect::Retry),
                            ..Default::default()
                        });
                    }
                    ConnectOutcome::Quiet => {}
                    ConnectOutcome::Fail => {
                        return Err(Error::transport(transport, "connection reset"));
                    }
                    ConnectOutcome::Reject(advice) => {
                        reply.advice = Some(advice);
                        return Ok(reject(reply, "500::Connect refused"));
                    }
                }
            }
            meta::SUBSCRIBE => {
                let pattern = request.subscription.clone().unwrap_or_default();
                reply.subscription = Some(pattern.clone());
                if let Some(error) = self.rejected_subscriptions.get(&pattern) {
                    return Ok(reject(reply, error));
                }
                if !self.subscriptions.contains(&pattern) {
                    self.subscriptions.push(pattern);
                }
            }
            meta::UNSUBSCRIBE => {
                let pattern = request.subscription.clone().unwrap_or_default();
                self.subscriptions.retain(|s| *s != pattern);
                reply.subscription = Some(pattern);
            }
            meta::DISCONNECT => {}
            channel => {
                if let Some(error) = self.rejected_publishes.get(channel) {
                    return Ok(reject(reply, error));
                }
                let subscribed = self.subscriptions.iter().any(|p| matches(p, channel));
                if subscribed
                    && let Some(inbound) = &self.inbound
                    && let Some(data) = request.data.clone()
                {
                    let _ = inbound.send(delivery(channel, data));
                }
            }
        }

        Ok(reply)
    }
}

fn reject(mut reply: Message, error: &str) -> Message {
    reply.successful = Some(false);
    reply.error = Some(error.to_string());
    reply
}

fn delivery(channel: &str, data: Value) -> Message {
    Message {
        channel: channel.to_string(),
        data: Some(data),
        ..Default::default()
    }
}

// ============================================================================
// FakeTransport
// ============================================================================

/// Transport bound to a [`FakeServer`].
pub(crate) struct FakeTransport {
    name: &'static str,
    server: FakeServer,
    open: AtomicBool,
}

impl FakeTransport {
    fn new(name: &'static str, server: FakeServer) -> Self {
        Self {
            name,
            server,
            open: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        _url: &Url,
        _options: &TransportOptions,
        inbound: InboundSender,
    ) -> Result<()> {
        if self.server.state.lock().refused.contains(self.name) {
            return Err(Error::transport(self.name, "connection refused"));
        }
        self.server.attach(inbound);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_batch(&self, messages: Vec<Message>, _timeout: Duration) -> Result<Vec<Message>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::transport_closed(self.name));
        }
        self.server.exchange(self.name, messages).await
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn describe(&self) -> TransportInfo {
        TransportInfo {
            name: self.name.to_string(),
            supports_batching: true,
            is_open: self.open.load(Ordering::SeqCst),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Options with millisecond-scale retry delays.
pub(crate) fn fast_options() -> ClientOptions {
    ClientOptions::new()
        .with_request_timeout(Duration::from_secs(2))
        .with_backoff(BackoffPolicy {
            base: Duration::from_millis(10),
            multiplier: 2.0,
            max: Duration::from_millis(100),
            jitter: 0.0,
        })
        .with_batch(BatchOptions {
            max_size: 32,
            window: Duration::from_millis(2),
        })
}

/// Builds an unconnected client against `server`.
pub(crate) fn fast_client(server: &FakeServer, options: ClientOptions) -> Client {
    Client::builder("http://localhost/faye")
        .options(options)
        .transports(server.registry())
        .build()
        .expect("client builds")
}

/// Builds and connects a client against `server`.
pub(crate) async fn connected_client(server: &FakeServer) -> Client {
    let client = fast_client(server, fast_options());
    client.connect().await.expect("client connects");
    client
}

/// Callback that counts its invocations.
pub(crate) fn counting_callback() -> (Callback, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let callback: Callback = Arc::new(move |_: &Message| -> CallbackResult {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    (callback, count)
}

/// Polls `condition` for up to two seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
