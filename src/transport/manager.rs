//! Transport selection, fallback and quality monitoring.
//!
//! The manager owns the single active transport of a session. Candidates
//! are tried in preference order; a candidate that fails to connect is
//! removed for the rest of the session. When every candidate has failed the
//! list is restored to the configured preference and
//! [`Error::TransportsExhausted`] is returned.
//!
//! ```text
//! preferred: [websocket, long-polling]
//!
//! establish()            websocket ✗ ──► long-polling ✓   active = long-polling
//! apply_server_support   server offers [long-polling]     candidates narrowed
//! send()                 ──► QualityMonitor.record(ok, latency)
//! fall_back()            drop active, next establish() picks the next candidate
//! ```
//!
//! Switching is serialized by an async lock so that no two transports are
//! ever active at once.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::{ClientEvent, EventSink};
use crate::error::{Error, Result};
use crate::protocol::Message;

use super::{InboundSender, Transport, TransportInfo, TransportOptions, TransportRegistry};

// ============================================================================
// Constants
// ============================================================================

/// Name reported in errors when no transport is active.
const NO_TRANSPORT: &str = "none";

/// Extra time granted to a transport beyond its own send timeout.
const SEND_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// QualityThresholds
// ============================================================================

/// Limits beyond which a transport counts as degraded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    /// Consecutive failed sends that mark the transport degraded.
    pub max_consecutive_failures: u32,
    /// Error rate over the window that marks the transport degraded.
    pub max_error_rate: f64,
    /// Samples required before the error rate is considered.
    pub min_samples: usize,
    /// Number of recent sends kept.
    pub window: usize,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 4,
            max_error_rate: 0.5,
            min_samples: 10,
            window: 20,
        }
    }
}

impl QualityThresholds {
    /// Validates the thresholds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_consecutive_failures == 0 {
            return Err("max_consecutive_failures must be at least 1".to_string());
        }
        if !(self.max_error_rate > 0.0 && self.max_error_rate <= 1.0) {
            return Err("max_error_rate must be in (0, 1]".to_string());
        }
        if self.window == 0 || self.min_samples > self.window {
            return Err("min_samples must not exceed a non-zero window".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// QualityMonitor
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Sample {
    ok: bool,
    latency: Duration,
}

/// Rolling record of send outcomes for one transport.
#[derive(Debug, Clone)]
pub struct QualityMonitor {
    thresholds: QualityThresholds,
    samples: VecDeque<Sample>,
    consecutive_failures: u32,
}

impl QualityMonitor {
    /// Creates an empty monitor.
    #[must_use]
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self {
            thresholds,
            samples: VecDeque::with_capacity(thresholds.window),
            consecutive_failures: 0,
        }
    }

    /// Records the outcome of one send.
    pub fn record(&mut self, ok: bool, latency: Duration) {
        if self.samples.len() == self.thresholds.window {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { ok, latency });

        if ok {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }

    /// Returns the failure fraction over the window.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failed = self.samples.iter().filter(|s| !s.ok).count();
        failed as f64 / self.samples.len() as f64
    }

    /// Returns mean latency of successful sends in the window.
    #[must_use]
    pub fn mean_latency(&self) -> Option<Duration> {
        let ok: Vec<Duration> = self
            .samples
            .iter()
            .filter(|s| s.ok)
            .map(|s| s.latency)
            .collect();
        if ok.is_empty() {
            return None;
        }
        Some(ok.iter().sum::<Duration>() / ok.len() as u32)
    }

    /// Returns the current run of failed sends.
    #[inline]
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns the number of samples in the window.
    #[inline]
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Summarizes the window for logs and events.
    #[must_use]
    pub fn summary(&self) -> String {
        let latency = match self.mean_latency() {
            Some(latency) => format!("{}ms", latency.as_millis()),
            None => "n/a".to_string(),
        };
        format!(
            "{} consecutive failures, error rate {:.0}%, mean latency {latency}",
            self.consecutive_failures,
            self.error_rate() * 100.0
        )
    }

    /// Returns `true` if either threshold is crossed.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= self.thresholds.max_consecutive_failures
            || (self.samples.len() >= self.thresholds.min_samples
                && self.error_rate() >= self.thresholds.max_error_rate)
    }
}

// ============================================================================
// Session State
// ============================================================================

struct Active {
    name: String,
    transport: Arc<dyn Transport>,
    quality: QualityMonitor,
}

struct SessionState {
    /// Remaining candidates in preference order.
    candidates: Vec<String>,
    active: Option<Active>,
    /// Last transport that was active, for switch events.
    previous: Option<String>,
}

// ============================================================================
// TransportManager
// ============================================================================

/// Selects, monitors and replaces the active transport.
pub struct TransportManager {
    registry: TransportRegistry,
    preferred: Vec<String>,
    url: Url,
    options: TransportOptions,
    thresholds: QualityThresholds,
    events: EventSink,
    inbound: Mutex<Option<InboundSender>>,
    state: Mutex<SessionState>,
    switch_lock: tokio::sync::Mutex<()>,
}

// ============================================================================
// TransportManager - Constructor
// ============================================================================

impl TransportManager {
    /// Creates a manager over `preferred` connection types.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `preferred` is empty or names a type the
    /// registry does not provide.
    pub fn new(
        registry: TransportRegistry,
        preferred: &[String],
        url: Url,
        options: TransportOptions,
        thresholds: QualityThresholds,
        events: EventSink,
    ) -> Result<Self> {
        if preferred.is_empty() {
            return Err(Error::config("at least one connection type is required"));
        }

        let mut normalized: Vec<String> = Vec::with_capacity(preferred.len());
        for name in preferred {
            let name = name.to_ascii_lowercase();
            if !registry.contains(&name) {
                return Err(Error::config(format!(
                    "unknown connection type '{name}' (registered: {})",
                    registry.names().join(", ")
                )));
            }
            if !normalized.contains(&name) {
                normalized.push(name);
            }
        }

        Ok(Self {
            registry,
            state: Mutex::new(SessionState {
                candidates: normalized.clone(),
                active: None,
                previous: None,
            }),
            preferred: normalized,
            url,
            options,
            thresholds,
            events,
            inbound: Mutex::new(None),
            switch_lock: tokio::sync::Mutex::new(()),
        })
    }
}

// ============================================================================
// TransportManager - Public API
// ============================================================================

impl TransportManager {
    /// Returns the connection types still eligible this session.
    #[must_use]
    pub fn connection_types(&self) -> Vec<String> {
        self.state.lock().candidates.clone()
    }

    /// Returns the configured preference order.
    #[inline]
    #[must_use]
    pub fn preferred(&self) -> &[String] {
        &self.preferred
    }

    /// Describes the active transport, if any.
    #[must_use]
    pub fn active_info(&self) -> Option<TransportInfo> {
        self.state
            .lock()
            .active
            .as_ref()
            .map(|a| a.transport.describe())
    }

    /// Returns the active connection type, if any.
    #[must_use]
    pub fn active_name(&self) -> Option<String> {
        self.state.lock().active.as_ref().map(|a| a.name.clone())
    }

    /// Starts a new session delivering non-reply messages to `inbound`.
    ///
    /// Candidates are reset to the configured preference.
    pub fn begin_session(&self, inbound: InboundSender) {
        *self.inbound.lock() = Some(inbound);
        self.state.lock().candidates = self.preferred.clone();
    }

    /// Ensures a connected transport is active and describes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportsExhausted`] if no candidate connects.
    pub async fn establish(&self) -> Result<TransportInfo> {
        let _switching = self.switch_lock.lock().await;

        let stale = {
            let mut state = self.state.lock();
            let current = state.active.as_ref().map(|a| a.transport.describe());
            match current {
                Some(info) if info.is_open => return Ok(info),
                Some(_) => state.active.take(),
                None => None,
            }
        };

        if let Some(stale) = stale {
            debug!(transport = %stale.name, "Active transport closed, reconnecting");
            stale.transport.close().await;
        }

        let inbound = self
            .inbound
            .lock()
            .clone()
            .ok_or_else(|| Error::transport_closed(NO_TRANSPORT))?;

        let mut attempted = Vec::new();

        loop {
            let Some(name) = self.state.lock().candidates.first().cloned() else {
                break;
            };

            let transport: Arc<dyn Transport> = Arc::from(self.registry.create(&name)?);

            match transport
                .connect(&self.url, &self.options, inbound.clone())
                .await
            {
                Ok(()) => {
                    let info = transport.describe();
                    let from = {
                        let mut state = self.state.lock();
                        let from = state.previous.replace(name.clone());
                        state.active = Some(Active {
                            name: name.clone(),
                            transport,
                            quality: QualityMonitor::new(self.thresholds),
                        });
                        from
                    };

                    if from.as_deref() != Some(name.as_str()) {
                        info!(from = ?from, to = %name, "Transport selected");
                        self.events.emit(ClientEvent::TransportSwitched {
                            from,
                            to: name,
                        });
                    }
                    return Ok(info);
                }
                Err(e) => {
                    warn!(transport = %name, error = %e, "Transport failed to connect");
                    self.events.emit(ClientEvent::TransportFailed {
                        transport: name.clone(),
                        reason: e.to_string(),
                    });
                    attempted.push(format!("{name}: {e}"));
                    self.state.lock().candidates.retain(|c| *c != name);
                }
            }
        }

        self.state.lock().candidates = self.preferred.clone();

        Err(Error::TransportsExhausted {
            attempted: if attempted.is_empty() {
                "no candidates".to_string()
            } else {
                attempted.join("; ")
            },
        })
    }

    /// Narrows candidates to the types the server accepts.
    ///
    /// Returns `true` if the active transport was not accepted and has been
    /// closed; the caller must establish again and repeat the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if no candidate is accepted.
    pub async fn apply_server_support(&self, server_types: &[String]) -> Result<bool> {
        let _switching = self.switch_lock.lock().await;

        let dropped = {
            let mut state = self.state.lock();
            let common: Vec<String> = state
                .candidates
                .iter()
                .filter(|c| server_types.iter().any(|s| s.eq_ignore_ascii_case(c)))
                .cloned()
                .collect();

            if common.is_empty() {
                return Err(Error::protocol(format!(
                    "no common connection type (client: {}, server: {})",
                    state.candidates.join(", "),
                    server_types.join(", ")
                )));
            }

            state.candidates = common;

            let accepted = state
                .active
                .as_ref()
                .is_none_or(|a| state.candidates.contains(&a.name));
            if accepted { None } else { state.active.take() }
        };

        match dropped {
            Some(active) => {
                info!(transport = %active.name, "Server does not accept transport, switching");
                active.transport.close().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Sends a batch on the active transport and records its quality.
    ///
    /// # Errors
    ///
    /// Returns a transport error if nothing is active or the send fails.
    pub async fn send(&self, batch: Vec<Message>, send_timeout: Duration) -> Result<Vec<Message>> {
        let (name, transport) = {
            let state = self.state.lock();
            let active = state
                .active
                .as_ref()
                .ok_or_else(|| Error::transport_closed(NO_TRANSPORT))?;
            (active.name.clone(), Arc::clone(&active.transport))
        };

        let started = Instant::now();
        let result = match timeout(
            send_timeout + SEND_GRACE,
            transport.send_batch(batch, send_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::transport_timeout(
                name.as_str(),
                send_timeout.as_millis() as u64,
            )),
        };

        let mut state = self.state.lock();
        if let Some(active) = state.active.as_mut()
            && Arc::ptr_eq(&active.transport, &transport)
        {
            active.quality.record(result.is_ok(), started.elapsed());
        }

        result
    }

    /// Returns `true` if the active transport's quality is degraded.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.state
            .lock()
            .active
            .as_ref()
            .is_some_and(|a| a.quality.is_degraded())
    }

    /// Returns `true` if a candidate other than the active one remains.
    #[must_use]
    pub fn has_fallback(&self) -> bool {
        let state = self.state.lock();
        let active = state.active.as_ref().map(|a| a.name.as_str());
        state.candidates.iter().any(|c| Some(c.as_str()) != active)
    }

    /// Abandons the active transport for the rest of the session.
    ///
    /// The next [`establish`](Self::establish) selects the next candidate.
    /// Returns `false` if there was no alternative.
    pub async fn fall_back(&self) -> bool {
        let _switching = self.switch_lock.lock().await;

        let dropped = {
            let mut state = self.state.lock();
            let Some(active) = state.active.as_ref() else {
                return false;
            };
            let name = active.name.clone();
            if !state.candidates.iter().any(|c| *c != name) {
                return false;
            }
            state.candidates.retain(|c| *c != name);
            state.active.take()
        };

        if let Some(active) = dropped {
            let summary = active.quality.summary();
            warn!(
                transport = %active.name,
                error_rate = active.quality.error_rate(),
                mean_latency_ms = active.quality.mean_latency().map(|l| l.as_millis() as u64),
                "Transport degraded, falling back"
            );
            self.events.emit(ClientEvent::TransportFailed {
                transport: active.name.clone(),
                reason: format!("quality degraded ({summary})"),
            });
            active.transport.close().await;
        }
        true
    }

    /// Closes the active transport and ends the session.
    pub async fn close(&self) {
        let _switching = self.switch_lock.lock().await;

        let active = self.state.lock().active.take();
        if let Some(active) = active {
            debug!(transport = %active.name, "Closing transport");
            active.transport.close().await;
        }
        *self.inbound.lock() = None;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::transport::{LONG_POLLING, WEBSOCKET};

    struct StubTransport {
        name: &'static str,
        refuse: bool,
        fail_sends: bool,
        open: AtomicBool,
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn connect(&self, _: &Url, _: &TransportOptions, _: InboundSender) -> Result<()> {
            if self.refuse {
                return Err(Error::transport(self.name, "refused"));
            }
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn send_batch(&self, messages: Vec<Message>, _: Duration) -> Result<Vec<Message>> {
            if self.fail_sends {
                return Err(Error::transport(self.name, "send failed"));
            }
            Ok(messages
                .into_iter()
                .map(|m| Message {
                    successful: Some(true),
                    ..m
                })
                .collect())
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

    fn stub(name: &'static str, refuse: bool, fail_sends: bool) -> Box<dyn Transport> {
        Box::new(StubTransport {
            name,
            refuse,
            fail_sends,
            open: AtomicBool::new(false),
        })
    }

    fn manager(ws_refuses: bool, lp_refuses: bool, ws_fails_sends: bool) -> TransportManager {
        let registry = TransportRegistry::empty()
            .with(WEBSOCKET, move || stub(WEBSOCKET, ws_refuses, ws_fails_sends))
            .with(LONG_POLLING, move || stub(LONG_POLLING, lp_refuses, false));
        let manager = TransportManager::new(
            registry,
            &[WEBSOCKET.to_string(), LONG_POLLING.to_string()],
            Url::parse("http://localhost/faye").unwrap(),
            TransportOptions::default(),
            QualityThresholds::default(),
            EventSink::new(16),
        )
        .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.begin_session(tx);
        manager
    }

    #[test]
    fn test_quality_consecutive_failures() {
        let mut quality = QualityMonitor::new(QualityThresholds::default());
        for _ in 0..3 {
            quality.record(false, Duration::ZERO);
        }
        assert!(!quality.is_degraded());
        quality.record(false, Duration::ZERO);
        assert!(quality.is_degraded());

        quality.record(true, Duration::from_millis(5));
        assert_eq!(quality.consecutive_failures(), 0);
    }

    #[test]
    fn test_quality_error_rate_needs_min_samples() {
        let mut quality = QualityMonitor::new(QualityThresholds::default());
        for i in 0..9 {
            quality.record(i % 2 == 0, Duration::from_millis(10));
        }
        assert!(!quality.is_degraded());

        quality.record(false, Duration::from_millis(10));
        assert_eq!(quality.sample_count(), 10);
        assert!((quality.error_rate() - 0.5).abs() < f64::EPSILON);
        assert!(quality.is_degraded());
        assert_eq!(quality.mean_latency(), Some(Duration::from_millis(10)));
        assert_eq!(
            quality.summary(),
            "1 consecutive failures, error rate 50%, mean latency 10ms"
        );
    }

    #[test]
    fn test_quality_window_evicts_old_samples() {
        let mut quality = QualityMonitor::new(QualityThresholds::default());
        for _ in 0..3 {
            quality.record(false, Duration::ZERO);
        }
        for _ in 0..20 {
            quality.record(true, Duration::ZERO);
        }
        assert_eq!(quality.sample_count(), 20);
        assert_eq!(quality.error_rate(), 0.0);
    }

    #[test]
    fn test_thresholds_validate() {
        assert!(QualityThresholds::default().validate().is_ok());
        let bad = QualityThresholds {
            min_samples: 30,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_unknown_preference_is_config_error() {
        let result = TransportManager::new(
            TransportRegistry::with_defaults(),
            &["flash".to_string()],
            Url::parse("http://localhost/faye").unwrap(),
            TransportOptions::default(),
            QualityThresholds::default(),
            EventSink::new(4),
        );
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_establish_falls_back_on_connect_failure() {
        let manager = manager(true, false, false);
        let info = manager.establish().await.unwrap();

        assert_eq!(info.name, LONG_POLLING);
        assert_eq!(manager.connection_types(), vec![LONG_POLLING]);
        assert!(!manager.has_fallback());
    }

    #[tokio::test]
    async fn test_exhaustion_restores_preference() {
        let manager = manager(true, true, false);
        let err = manager.establish().await.unwrap_err();

        assert!(matches!(err, Error::TransportsExhausted { .. }));
        assert_eq!(manager.connection_types(), vec![WEBSOCKET, LONG_POLLING]);
        assert!(manager.active_info().is_none());
    }

    #[tokio::test]
    async fn test_server_support_switches_transport() {
        let manager = manager(false, false, false);
        assert_eq!(manager.establish().await.unwrap().name, WEBSOCKET);

        let switched = manager
            .apply_server_support(&["long-polling".to_string()])
            .await
            .unwrap();
        assert!(switched);
        assert!(manager.active_info().is_none());
        assert_eq!(manager.establish().await.unwrap().name, LONG_POLLING);

        let unchanged = manager
            .apply_server_support(&["long-polling".to_string(), "websocket".to_string()])
            .await
            .unwrap();
        assert!(!unchanged);
    }

    #[tokio::test]
    async fn test_empty_intersection_is_protocol_error() {
        let manager = manager(false, false, false);
        manager.establish().await.unwrap();
        let err = manager
            .apply_server_support(&["callback-polling".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_degraded_transport_falls_back() {
        let manager = manager(false, false, true);
        let mut events = manager.events.subscribe();
        manager.establish().await.unwrap();

        for _ in 0..4 {
            let request = Message {
                channel: "/meta/connect".to_string(),
                ..Default::default()
            };
            assert!(manager.send(vec![request], Duration::from_secs(1)).await.is_err());
        }
        assert!(manager.is_degraded());
        assert!(manager.has_fallback());

        assert!(manager.fall_back().await);
        let reason = loop {
            if let ClientEvent::TransportFailed { reason, .. } = events.recv().await.unwrap() {
                break reason;
            }
        };
        assert_eq!(
            reason,
            "quality degraded (4 consecutive failures, error rate 100%, mean latency n/a)"
        );
        assert_eq!(manager.establish().await.unwrap().name, LONG_POLLING);
        assert!(!manager.is_degraded());
        assert!(!manager.fall_back().await);
    }

    #[tokio::test]
    async fn test_send_without_active_transport() {
        let manager = manager(false, false, false);
        let err = manager
            .send(Vec::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportClosed { .. }));
    }
}
