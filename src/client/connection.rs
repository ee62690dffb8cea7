//! Connection lifecycle.
//!
//! The [`ConnectionStateMachine`] is the sole writer of the session state.
//! A session runs two tasks:
//!
//! | Task | Role |
//! |------|------|
//! | supervisor | handshake, `/meta/connect` cycle, backoff, transport fallback |
//! | inbound | incoming extensions, advice forwarding, delivery dispatch |
//!
//! ```text
//! Unconnected ──connect()──► Handshaking ──ok──► Connected ◄──ok── Reconnecting
//!      ▲                        │    ▲              │  ▲               │
//!      │                        │    └─threshold────┼──┼───────────────┘
//!      │                        │                   │  └─connect fails─┘
//!      └────disconnect()────────┴───────────────────┘
//!
//! any state ──advice none / attempts exhausted──► Disconnected
//! ```
//!
//! Only the supervisor sends handshakes and `/meta/connect`, so at most one
//! of each is ever in flight. Advice arriving on any reply is funnelled to
//! the supervisor over a channel and applied between suspension points.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionPipeline};
use crate::identifiers::ClientId;
use crate::protocol::{Advice, BAYEUX_VERSION, ErrorKind, Message, Reconnect};
use crate::transport::{TransportManager, TransportRegistry};

use super::backoff::Backoff;
use super::batcher::MessageBatcher;
use super::courier::Courier;
use super::events::{ClientEvent, EventSink};
use super::options::ClientOptions;
use super::state::{ConnectionState, StateCell, StateView};
use super::subscriptions::SubscriptionManager;

// ============================================================================
// Types
// ============================================================================

/// Background tasks of a running session.
struct SessionTasks {
    supervisor: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

/// Where the supervisor goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshake,
    Connect,
}

/// Result of one exchange plus the advice that came with it.
struct Attempt<T> {
    advice: Option<Advice>,
    result: Result<T>,
}

impl<T> Attempt<T> {
    fn failed(error: Error) -> Self {
        Self {
            advice: None,
            result: Err(error),
        }
    }
}

// ============================================================================
// Guidance
// ============================================================================

/// Current advice plus the channel that updates it.
struct Guidance {
    control: mpsc::UnboundedReceiver<Advice>,
    advice: Advice,
}

impl Guidance {
    /// Merges `newer`; advice of `none` ends the session.
    fn absorb(&mut self, newer: Option<Advice>) -> Result<()> {
        if let Some(newer) = newer {
            self.advice.merge(&newer);
        }
        if self.advice.forbids_reconnect() {
            return Err(Error::fatal("server advised reconnect=none"));
        }
        Ok(())
    }

    /// Consumes a pending `reconnect=handshake`.
    ///
    /// Advice applies to the exchange it arrived on, so once acted upon the
    /// reconnect action falls back to retry.
    fn take_handshake(&mut self) -> bool {
        if self.advice.reconnect() != Reconnect::Handshake {
            return false;
        }
        self.advice.reconnect = Some(Reconnect::Retry);
        true
    }

    /// Runs `operation` while applying advice that arrives meanwhile.
    async fn race<T>(&mut self, operation: impl Future<Output = T>) -> Result<T> {
        tokio::pin!(operation);
        loop {
            tokio::select! {
                output = &mut operation => return Ok(output),
                Some(newer) = self.control.recv() => self.absorb(Some(newer))?,
            }
        }
    }
}

// ============================================================================
// ConnectionStateMachine
// ============================================================================

/// Owns the lifecycle and every component of a client.
pub struct ConnectionStateMachine {
    pub(crate) options: ClientOptions,
    cell: StateCell,
    pub(crate) manager: Arc<TransportManager>,
    courier: Arc<Courier>,
    pub(crate) batcher: Arc<MessageBatcher>,
    pub(crate) subscriptions: Arc<SubscriptionManager>,
    pub(crate) pipeline: Arc<ExtensionPipeline>,
    pub(crate) events: EventSink,
    tasks: Mutex<Option<SessionTasks>>,
}

// ============================================================================
// ConnectionStateMachine - Constructor
// ============================================================================

impl ConnectionStateMachine {
    pub(crate) fn new(
        url: Url,
        options: ClientOptions,
        registry: TransportRegistry,
        extensions: Vec<Arc<dyn Extension>>,
    ) -> Result<Self> {
        let events = EventSink::new(options.event_capacity);
        let cell = StateCell::new(events.clone());

        let pipeline = Arc::new(ExtensionPipeline::new(events.clone()));
        for extension in extensions {
            pipeline.add(extension);
        }

        let manager = Arc::new(TransportManager::new(
            registry,
            &options.connection_types,
            url,
            options.transport_options(),
            options.quality,
            events.clone(),
        )?);

        let courier = Arc::new(Courier::new(Arc::clone(&pipeline), Arc::clone(&manager)));
        let batcher = Arc::new(MessageBatcher::new(
            options.batch,
            options.request_timeout,
            Arc::clone(&courier),
            cell.view(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::clone(&batcher),
            cell.view(),
            events.clone(),
        ));

        Ok(Self {
            options,
            cell,
            manager,
            courier,
            batcher,
            subscriptions,
            pipeline,
            events,
            tasks: Mutex::new(None),
        })
    }
}

// ============================================================================
// ConnectionStateMachine - Public API
// ============================================================================

impl ConnectionStateMachine {
    /// Returns a read-only view of the session.
    #[inline]
    #[must_use]
    pub fn view(&self) -> StateView {
        self.cell.view()
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.cell.state()
    }

    /// Connects, or joins the attempt already in flight.
    ///
    /// # Errors
    ///
    /// - [`Error::FatalConnection`] if the session gave up
    /// - [`Error::NotConnected`] if a disconnect interrupted the attempt
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let view = self.cell.view();

        if self.cell.begin_handshake() {
            self.start_session();
        }

        let outcome = view.settled().await;
        match outcome.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => Err(Error::fatal(
                outcome
                    .fatal_reason
                    .unwrap_or_else(|| "connection failed".to_string()),
            )),
            state => Err(Error::not_connected(state)),
        }
    }

    /// Ends the session and returns to Unconnected.
    ///
    /// Background work is cancelled before `/meta/disconnect` is sent; the
    /// server's answer is not required.
    pub async fn disconnect(&self) -> Result<()> {
        let tasks = self.tasks.lock().take();
        let running = tasks.is_some();

        if let Some(tasks) = tasks {
            tasks.supervisor.abort();
            tasks.inbound.abort();
            let _ = tasks.supervisor.await;
            let _ = tasks.inbound.await;
        }

        if !running && self.cell.state() == ConnectionState::Unconnected {
            return Ok(());
        }

        self.batcher.stop();

        let open = self.manager.active_info().is_some_and(|info| info.is_open);
        if let Some(client_id) = self.cell.client_id()
            && open
        {
            match self
                .courier
                .send_one(Message::disconnect(&client_id), self.options.request_timeout)
                .await
            {
                Ok(reply) => debug!(successful = reply.is_successful(), "Disconnect acknowledged"),
                Err(e) => debug!(error = %e, "Disconnect not acknowledged"),
            }
        }

        self.manager.close().await;
        self.subscriptions.reset_pending();
        self.cell.reset();

        info!("Disconnected");
        Ok(())
    }
}

// ============================================================================
// ConnectionStateMachine - Session
// ============================================================================

impl ConnectionStateMachine {
    fn start_session(self: &Arc<Self>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let mut tasks = self.tasks.lock();

        self.manager.begin_session(inbound_tx);
        self.batcher.start(control_tx.clone());

        let inbound = tokio::spawn(Arc::clone(self).run_inbound(inbound_rx, control_tx));
        let supervisor = tokio::spawn(Arc::clone(self).supervise(control_rx));

        *tasks = Some(SessionTasks {
            supervisor,
            inbound,
        });
    }

    /// Inbound loop: every message not claimed as a reply.
    async fn run_inbound(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Message>,
        control: mpsc::UnboundedSender<Advice>,
    ) {
        while let Some(message) = inbound.recv().await {
            let Some(message) = self.pipeline.incoming(message).await else {
                continue;
            };

            if let Some(advice) = message.advice {
                let _ = control.send(advice);
            }

            if message.is_reply() || message.is_meta() {
                debug!(channel = %message.channel, "Unsolicited meta message ignored");
                continue;
            }

            let delivered = self.subscriptions.dispatch(&message);
            if delivered == 0 {
                debug!(channel = %message.channel, "No subscriber for delivery");
            }
        }
    }

    /// Supervisor: drives the session until it is cancelled or fails.
    async fn supervise(self: Arc<Self>, control: mpsc::UnboundedReceiver<Advice>) {
        let mut guidance = Guidance {
            control,
            advice: self.options.default_advice,
        };
        let mut backoff = Backoff::new(self.options.backoff);
        let mut phase = Phase::Handshake;

        let failure = loop {
            let next = match phase {
                Phase::Handshake => self.handshake_phase(&mut guidance, &mut backoff).await,
                Phase::Connect => self.connect_phase(&mut guidance, &mut backoff).await,
            };
            match next {
                Ok(next) => phase = next,
                Err(e) => break e,
            }
        };

        self.fail_session(failure).await;
    }

    /// Handshakes until success, then replays subscriptions.
    async fn handshake_phase(&self, guidance: &mut Guidance, backoff: &mut Backoff) -> Result<Phase> {
        let mut attempts: u32 = 0;

        loop {
            let attempt = guidance.race(self.handshake_once()).await?;
            guidance.absorb(attempt.advice)?;

            let failure = match attempt.result {
                Ok(client_id) => {
                    backoff.reset();
                    info!(client_id = %client_id, "Handshake successful");
                    self.cell.establish(client_id);

                    match guidance.race(self.subscriptions.replay()).await? {
                        Ok(()) => return Ok(Phase::Connect),
                        Err(e) => {
                            warn!(error = %e, "Subscription replay failed");
                            self.rehandshake();
                            e
                        }
                    }
                }
                Err(e) => {
                    if self.abandon_degraded().await {
                        continue;
                    }
                    e
                }
            };

            attempts += 1;
            warn!(attempt = attempts, error = %failure, "Handshake failed");

            if let Some(max) = self.options.max_handshake_attempts
                && attempts >= max
            {
                return Err(Error::fatal(format!(
                    "handshake failed after {attempts} attempts: {failure}"
                )));
            }

            let delay = backoff.next_delay(guidance.advice.interval());
            debug!(delay_ms = delay.as_millis() as u64, "Retrying handshake");
            guidance.race(sleep(delay)).await?;
        }
    }

    /// Drops a degraded transport if another candidate remains.
    async fn abandon_degraded(&self) -> bool {
        self.manager.is_degraded() && self.manager.has_fallback() && self.manager.fall_back().await
    }

    /// One handshake, repeated once if the server moves us to another
    /// transport.
    async fn handshake_once(&self) -> Attempt<ClientId> {
        let mut switched = false;

        loop {
            if let Err(e) = self.manager.establish().await {
                return Attempt::failed(e);
            }

            let request = Message::handshake(&self.manager.connection_types());
            let reply = match self
                .courier
                .send_one(request, self.options.request_timeout)
                .await
            {
                Ok(reply) => reply,
                Err(e) => return Attempt::failed(e),
            };

            let advice = reply.advice;
            let result = self.accept_handshake(&reply);
            let client_id = match result {
                Ok(client_id) => client_id,
                Err(e) => return Attempt { advice, result: Err(e) },
            };

            if let Some(types) = &reply.supported_connection_types {
                match self.manager.apply_server_support(types).await {
                    Ok(false) => {}
                    Ok(true) if !switched => {
                        switched = true;
                        continue;
                    }
                    Ok(true) => {
                        return Attempt {
                            advice,
                            result: Err(Error::protocol("transport negotiation did not settle")),
                        };
                    }
                    Err(e) => return Attempt { advice, result: Err(e) },
                }
            }

            return Attempt {
                advice,
                result: Ok(client_id),
            };
        }
    }

    /// Checks a handshake reply and extracts the client id.
    fn accept_handshake(&self, reply: &Message) -> Result<ClientId> {
        if !reply.is_successful() {
            return Err(Error::handshake(reply.failure_reason()));
        }

        if let Some(version) = &reply.version
            && major(version) != major(BAYEUX_VERSION)
        {
            return Err(Error::protocol(format!(
                "unsupported protocol version {version}"
            )));
        }

        reply
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::protocol("handshake reply has no clientId"))
    }

    /// Cycles `/meta/connect` until a re-handshake is needed.
    async fn connect_phase(&self, guidance: &mut Guidance, backoff: &mut Backoff) -> Result<Phase> {
        let mut failures: u32 = 0;

        loop {
            let Some(client_id) = self.cell.client_id() else {
                return Ok(self.rehandshake());
            };

            let hold = guidance.advice.timeout() + self.options.request_timeout;
            let attempt = guidance.race(self.connect_once(&client_id, hold)).await?;
            guidance.absorb(attempt.advice)?;

            let failure = match attempt.result {
                Ok(reply) if reply.is_successful() => {
                    failures = 0;
                    backoff.reset();
                    if self.cell.state() == ConnectionState::Reconnecting {
                        self.cell.transition(ConnectionState::Connected);
                    }

                    if guidance.take_handshake() {
                        info!("Server requested a new handshake");
                        return Ok(self.rehandshake());
                    }

                    let interval = guidance.advice.interval();
                    if !interval.is_zero() {
                        guidance.race(sleep(interval)).await?;
                    }
                    continue;
                }
                Ok(reply) => {
                    let unknown_client = reply
                        .bayeux_error()
                        .is_some_and(|e| e.kind() == ErrorKind::Unauthorized);
                    if unknown_client {
                        info!("Server no longer knows this client");
                        return Ok(self.rehandshake());
                    }
                    Error::protocol(reply.failure_reason())
                }
                Err(e) => e,
            };

            failures += 1;
            warn!(failures, error = %failure, "Connect failed");
            self.cell.transition(ConnectionState::Reconnecting);

            if guidance.take_handshake() {
                return Ok(self.rehandshake());
            }

            if self.abandon_degraded().await {
                return Ok(self.rehandshake());
            }

            if failures >= self.options.reconnect_threshold {
                info!(failures, "Connect failure threshold reached");
                return Ok(self.rehandshake());
            }

            let delay = backoff.next_delay(guidance.advice.interval());
            debug!(delay_ms = delay.as_millis() as u64, "Retrying connect");
            guidance.race(sleep(delay)).await?;
        }
    }

    /// One `/meta/connect` exchange.
    async fn connect_once(&self, client_id: &ClientId, hold: Duration) -> Attempt<Message> {
        let transport = match self.manager.establish().await {
            Ok(info) => info.name,
            Err(e) => return Attempt::failed(e),
        };

        match self
            .courier
            .send_one(Message::connect(client_id, &transport), hold)
            .await
        {
            Ok(reply) => Attempt {
                advice: reply.advice,
                result: Ok(reply),
            },
            Err(e) => Attempt::failed(e),
        }
    }

    /// Drops the client id so the next phase handshakes afresh.
    fn rehandshake(&self) -> Phase {
        self.cell.set_client_id(None);
        self.cell.transition(ConnectionState::Handshaking);
        self.subscriptions.reset_pending();
        Phase::Handshake
    }

    /// Tears the session down after an unrecoverable failure.
    async fn fail_session(&self, failure: Error) {
        let reason = match failure {
            Error::FatalConnection { reason } => reason,
            other => other.to_string(),
        };
        error!(%reason, "Connection failed permanently");

        if let Some(tasks) = self.tasks.lock().take() {
            tasks.inbound.abort();
        }

        self.batcher.stop();
        self.manager.close().await;
        self.subscriptions.reset_pending();

        self.events.emit(ClientEvent::Fatal {
            reason: reason.clone(),
        });
        self.cell.fail(&reason);
    }
}

/// Returns the major component of a version string.
fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version).trim()
}

// ============================================================================
// Tests
// ============================================================================
