//! Subscription tracking, replay and dispatch.
//!
//! Callbacks are grouped by pattern. The server acknowledges patterns, not
//! callbacks, so the acknowledgement state lives on the pattern:
//!
//! ```text
//!            subscribe ok              unsubscribe (last callback)
//!  Pending ───────────────► Active ───────────────────────────► Unsubscribing ──► removed
//!     ▲  │ rejected                                                    │ rejected
//!     │  └────────► Failed                                             ▼
//!     └──────────── re-handshake / disconnect ◄──────────────────── Active
//! ```
//!
//! Only Active patterns receive deliveries. A Pending pattern whose last
//! callback is removed is dropped at once and unsubscribed on the server as
//! soon as its subscribe is acknowledged.

// ============================================================================
// Imports
// ============================================================================

use std::error::Error as StdError;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{Channel, Message};

use super::batcher::MessageBatcher;
use super::events::{ClientEvent, EventSink};
use super::state::StateView;

// ============================================================================
// Types
// ============================================================================

/// Outcome of a callback invocation.
pub type CallbackResult = std::result::Result<(), Box<dyn StdError + Send + Sync>>;

/// Handler invoked for each delivery on a matching channel.
///
/// Identity is the `Arc` pointer: registering the same `Arc` twice on one
/// pattern is a no-op.
pub type Callback = Arc<dyn Fn(&Message) -> CallbackResult + Send + Sync>;

// ============================================================================
// SubscriptionState
// ============================================================================

/// Server acknowledgement state of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Requested, not yet acknowledged.
    Pending,
    /// Acknowledged; receives deliveries.
    Active,
    /// Unsubscribe requested.
    Unsubscribing,
    /// Rejected by the server during replay.
    Failed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Unsubscribing => "unsubscribing",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of one pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Subscription pattern.
    pub pattern: String,
    /// Acknowledgement state.
    pub state: SubscriptionState,
    /// Number of registered callbacks.
    pub callbacks: usize,
}

struct Entry {
    pattern: Channel,
    callbacks: Vec<Callback>,
    state: SubscriptionState,
}

impl Entry {
    fn holds(&self, callback: &Callback) -> bool {
        self.callbacks.iter().any(|c| Arc::ptr_eq(c, callback))
    }

    fn release(&mut self, callback: &Callback) {
        self.callbacks.retain(|c| !Arc::ptr_eq(c, callback));
    }
}

// ============================================================================
// SubscriptionManager
// ============================================================================

/// Desired and acknowledged subscriptions of a client.
pub struct SubscriptionManager {
    entries: Mutex<FxHashMap<String, Entry>>,
    batcher: Arc<MessageBatcher>,
    state: StateView,
    events: EventSink,
}

impl SubscriptionManager {
    pub(crate) fn new(batcher: Arc<MessageBatcher>, state: StateView, events: EventSink) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            batcher,
            state,
            events,
        }
    }

    /// Registers `callback` on `channel`, subscribing on the server if the
    /// pattern is new.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidChannel`] for a malformed or reserved pattern
    /// - [`Error::NotConnected`] outside Connected and Reconnecting
    /// - [`Error::SubscriptionRejected`] if the server refuses
    pub async fn subscribe(&self, channel: &str, callback: Callback) -> Result<()> {
        let pattern = Channel::for_subscribe(channel)?;
        let client_id = self.state.require_session()?;

        let needs_send = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(pattern.as_str().to_string())
                .or_insert_with(|| Entry {
                    pattern: pattern.clone(),
                    callbacks: Vec::new(),
                    state: SubscriptionState::Pending,
                });

            if entry.holds(&callback) && entry.state != SubscriptionState::Failed {
                debug!(channel = %pattern, "Callback already registered");
                return Ok(());
            }

            let first = entry.callbacks.is_empty() || entry.state == SubscriptionState::Failed;
            if !entry.holds(&callback) {
                entry.callbacks.push(Arc::clone(&callback));
            }
            if first {
                entry.state = SubscriptionState::Pending;
            }
            first
        };

        if !needs_send {
            return Ok(());
        }

        let outcome = self
            .batcher
            .submit(Message::subscribe(&client_id, &pattern))
            .await;

        match outcome {
            Ok(reply) if reply.is_successful() => {
                if self.activate(&pattern) {
                    info!(channel = %pattern, "Subscribed");
                } else {
                    self.release_abandoned(vec![pattern]).await;
                }
                Ok(())
            }
            Ok(reply) => {
                let reason = reply.failure_reason();
                warn!(channel = %pattern, %reason, "Subscription rejected");
                self.withdraw(&pattern, &callback, SubscriptionState::Failed);
                Err(Error::subscription_rejected(pattern.as_str(), reason))
            }
            Err(e) => {
                warn!(channel = %pattern, error = %e, "Subscribe failed");
                self.withdraw(&pattern, &callback, SubscriptionState::Pending);
                Err(e)
            }
        }
    }

    /// Removes `callback` from `channel`, unsubscribing on the server when
    /// it was the last one.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidChannel`] for a malformed pattern
    /// - [`Error::SubscriptionRejected`] if the server refuses
    pub async fn unsubscribe(&self, channel: &str, callback: &Callback) -> Result<()> {
        let pattern = Channel::for_subscribe(channel)?;

        {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(pattern.as_str()) else {
                return Ok(());
            };

            entry.release(callback);
            if !entry.callbacks.is_empty() {
                return Ok(());
            }

            if entry.state != SubscriptionState::Active || !self.state.state().accepts_requests() {
                entries.remove(pattern.as_str());
                debug!(channel = %pattern, "Subscription removed locally");
                return Ok(());
            }

            entry.state = SubscriptionState::Unsubscribing;
        }

        let outcome = match self.state.require_session() {
            Ok(client_id) => {
                self.batcher
                    .submit(Message::unsubscribe(&client_id, &pattern))
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(reply) if reply.is_successful() => {
                let mut entries = self.entries.lock();
                if entries
                    .get(pattern.as_str())
                    .is_some_and(|e| e.callbacks.is_empty())
                {
                    entries.remove(pattern.as_str());
                }
                info!(channel = %pattern, "Unsubscribed");
                Ok(())
            }
            Ok(reply) => {
                let reason = reply.failure_reason();
                warn!(channel = %pattern, %reason, "Unsubscribe rejected");
                self.mark(&pattern, SubscriptionState::Unsubscribing, SubscriptionState::Active);
                Err(Error::subscription_rejected(pattern.as_str(), reason))
            }
            Err(e) => {
                warn!(channel = %pattern, error = %e, "Unsubscribe failed");
                self.mark(&pattern, SubscriptionState::Unsubscribing, SubscriptionState::Active);
                Err(e)
            }
        }
    }

    /// Delivers `message` to every callback of every Active matching
    /// pattern, once per callback.
    ///
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, message: &Message) -> usize {
        let targets: Vec<Callback> = {
            let entries = self.entries.lock();
            let mut targets: Vec<Callback> = Vec::new();
            for entry in entries.values() {
                if entry.state != SubscriptionState::Active || !entry.pattern.matches(&message.channel)
                {
                    continue;
                }
                for callback in &entry.callbacks {
                    if !targets.iter().any(|t| Arc::ptr_eq(t, callback)) {
                        targets.push(Arc::clone(callback));
                    }
                }
            }
            targets
        };

        for callback in &targets {
            let reason = match catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "callback panicked".to_string(),
            };

            warn!(channel = %message.channel, %reason, "Subscription callback failed");
            self.events.emit(ClientEvent::CallbackFailed {
                channel: message.channel.clone(),
                reason,
            });
        }

        targets.len()
    }

    /// Re-subscribes every pattern after a handshake.
    ///
    /// Patterns without callbacks are dropped; the rest are reset to
    /// Pending and sent as one batch.
    ///
    /// # Errors
    ///
    /// Returns the first transport-level failure; the affected patterns stay
    /// Pending until the next replay.
    pub(crate) async fn replay(&self) -> Result<()> {
        let patterns: Vec<Channel> = {
            let mut entries = self.entries.lock();
            entries.retain(|_, e| !e.callbacks.is_empty());
            for entry in entries.values_mut() {
                entry.state = SubscriptionState::Pending;
            }
            entries.values().map(|e| e.pattern.clone()).collect()
        };

        if patterns.is_empty() {
            return Ok(());
        }

        let client_id = self.state.require_session()?;

        info!(count = patterns.len(), "Replaying subscriptions");

        let requests = patterns
            .iter()
            .map(|p| Message::subscribe(&client_id, p))
            .collect();
        let results = self.batcher.submit_all(requests).await;

        let mut interrupted = None;
        let mut abandoned = Vec::new();
        for (pattern, result) in patterns.into_iter().zip(results) {
            let reason = match result {
                Ok(reply) if reply.is_successful() => {
                    if !self.activate(&pattern) {
                        abandoned.push(pattern);
                    }
                    continue;
                }
                Ok(reply) => reply.failure_reason(),
                Err(Error::MessageDropped { .. }) => "dropped by extension".to_string(),
                Err(e) => {
                    debug!(channel = %pattern, error = %e, "Replay interrupted");
                    if interrupted.is_none() {
                        interrupted = Some(e);
                    }
                    continue;
                }
            };

            warn!(channel = %pattern, %reason, "Replayed subscription rejected");
            self.mark(&pattern, SubscriptionState::Pending, SubscriptionState::Failed);
            self.events.emit(ClientEvent::SubscriptionFailed {
                channel: pattern.as_str().to_string(),
                reason,
            });
        }

        self.release_abandoned(abandoned).await;

        match interrupted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unsubscribes patterns the server acknowledged after every callback
    /// was removed locally.
    async fn release_abandoned(&self, patterns: Vec<Channel>) {
        if patterns.is_empty() {
            return;
        }
        let Ok(client_id) = self.state.require_session() else {
            return;
        };

        let requests = patterns
            .iter()
            .map(|p| Message::unsubscribe(&client_id, p))
            .collect();
        let results = self.batcher.submit_all(requests).await;

        for (pattern, result) in patterns.iter().zip(results) {
            match result {
                Ok(reply) if reply.is_successful() => {
                    debug!(channel = %pattern, "Released subscription abandoned while pending");
                }
                Ok(reply) => {
                    warn!(channel = %pattern, reason = %reply.failure_reason(), "Release rejected");
                }
                Err(e) => warn!(channel = %pattern, error = %e, "Release failed"),
            }
        }
    }

    /// Forgets server acknowledgements; every pattern goes to Pending.
    pub(crate) fn reset_pending(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.callbacks.is_empty());
        for entry in entries.values_mut() {
            entry.state = SubscriptionState::Pending;
        }
    }

    /// Returns every pattern, sorted.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .entries
            .lock()
            .values()
            .map(|e| SubscriptionInfo {
                pattern: e.pattern.as_str().to_string(),
                state: e.state,
                callbacks: e.callbacks.len(),
            })
            .collect();
        infos.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        infos
    }

    /// Marks an acknowledged pattern Active.
    ///
    /// Returns `false` if the pattern was removed while the subscribe was in
    /// flight.
    fn activate(&self, pattern: &Channel) -> bool {
        match self.entries.lock().get_mut(pattern.as_str()) {
            Some(entry) => {
                if entry.state == SubscriptionState::Pending {
                    entry.state = SubscriptionState::Active;
                }
                true
            }
            None => false,
        }
    }

    /// Moves `pattern` from `from` to `to` if it is still in `from`.
    fn mark(&self, pattern: &Channel, from: SubscriptionState, to: SubscriptionState) {
        if let Some(entry) = self.entries.lock().get_mut(pattern.as_str())
            && entry.state == from
        {
            entry.state = to;
        }
    }

    /// Undoes a failed subscribe of `callback`.
    ///
    /// Other callbacks on the pattern keep it in `remaining`.
    fn withdraw(&self, pattern: &Channel, callback: &Callback, remaining: SubscriptionState) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(pattern.as_str()) else {
            return;
        };

        entry.release(callback);
        if entry.callbacks.is_empty() {
            entries.remove(pattern.as_str());
        } else if entry.state == SubscriptionState::Pending {
            entry.state = remaining;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::client::ConnectionState;
    use crate::transport::testing::{FakeServer, connected_client, counting_callback, wait_until};

    #[tokio::test]
    async fn test_subscribe_becomes_active() {
        let server = FakeServer::new();
        let client = connected_client(&server).await;
        let (callback, _count) = counting_callback();

        client.subscribe("/foo/bar", callback).await.unwrap();

        let subs = client.subscriptions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].state, SubscriptionState::Active);
        assert_eq!(server.received_on("/meta/subscribe").len(), 1);
    }

    #[tokio::test]
    async fn test_same_callback_twice_delivers_once() {
        let server = FakeServer::new();
        let client = connected_client(&server).await;
        let (callback, count) = counting_callback();

        client.subscribe("/foo", Arc::clone(&callback)).await.unwrap();
        client.subscribe("/foo", Arc::clone(&callback)).await.unwrap();
        assert_eq!(server.received_on("/meta/subscribe").len(), 1);

        server.deliver("/foo", json!({"n": 1}));
        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_callback_shares_pattern() {
        let server = FakeServer::new();
        let client = connected_client(&server).await;
        let (first, first_count) = counting_callback();
        let (second, second_count) = counting_callback();

        client.subscribe("/chat/*", first).await.unwrap();
        client.subscribe("/chat/*", second).await.unwrap();
        assert_eq!(server.received_on("/meta/subscribe").len(), 1);
        assert_eq!(client.subscriptions()[0].callbacks, 2);

        server.deliver("/chat/room", json!("hi"));
        assert!(wait_until(|| first_count.load(Ordering::SeqCst) == 1
            && second_count.load(Ordering::SeqCst) == 1)
        .await);
    }

    #[tokio::test]
    async fn test_callback_failure_is_isolated() {
        let server = FakeServer::new();
        let client = connected_client(&server).await;
        let mut events = client.events();

        let failing: Callback = Arc::new(|_: &Message| -> CallbackResult { Err("bad payload".into()) });
        let (healthy, count) = counting_callback();

        client.subscribe("/a", failing).await.unwrap();
        client.subscribe("/a", healthy).await.unwrap();

        server.deliver("/a", json!(1));
        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1).await);

        loop {
            if let ClientEvent::CallbackFailed { reason, .. } = events.recv().await.unwrap() {
                assert_eq!(reason, "bad payload");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_rejected_subscription_is_reported() {
        let server = FakeServer::new();
        server.reject_subscription("/private", "403:/private:Forbidden");
        let client = connected_client(&server).await;
        let (callback, _) = counting_callback();

        let err = client.subscribe("/private", callback).await.unwrap_err();
        assert!(matches!(err, Error::SubscriptionRejected { .. }));
        assert!(client.subscriptions().is_empty());
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_invalid_channels_rejected_before_sending() {
        let server = FakeServer::new();
        let client = connected_client(&server).await;
        let (callback, _) = counting_callback();

        for channel in ["/meta/foo", "/service/x", "/a//b", "/a/**/b", "nope"] {
            let err = client
                .subscribe(channel, Arc::clone(&callback))
                .await
                .unwrap_err();
            assert!(err.is_subscription_error(), "{channel}");
        }
        assert!(server.received_on("/meta/subscribe").is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_last_callback() {
        let server = FakeServer::new();
        let client = connected_client(&server).await;
        let (first, _) = counting_callback();
        let (second, _) = counting_callback();

        client.subscribe("/foo", Arc::clone(&first)).await.unwrap();
        client.subscribe("/foo", Arc::clone(&second)).await.unwrap();

        client.unsubscribe("/foo", &first).await.unwrap();
        assert!(server.received_on("/meta/unsubscribe").is_empty());

        client.unsubscribe("/foo", &second).await.unwrap();
        assert_eq!(server.received_on("/meta/unsubscribe").len(), 1);
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_while_pending_releases_on_server() {
        let server = FakeServer::new();
        let client = connected_client(&server).await;
        server.hold_subscribes(Duration::from_millis(100));
        let (callback, _) = counting_callback();

        let subscribing = tokio::spawn({
            let client = client.clone();
            let callback = Arc::clone(&callback);
            async move { client.subscribe("/foo", callback).await }
        });
        assert!(wait_until(|| !client.subscriptions().is_empty()).await);
        assert_eq!(client.subscriptions()[0].state, SubscriptionState::Pending);

        client.unsubscribe("/foo", &callback).await.unwrap();
        assert!(client.subscriptions().is_empty());

        subscribing.await.unwrap().unwrap();
        assert_eq!(server.received_on("/meta/subscribe").len(), 1);
        assert!(wait_until(|| server.received_on("/meta/unsubscribe").len() == 1).await);
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_patterns_do_not_receive() {
        let server = FakeServer::new();
        let client = connected_client(&server).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: Callback = Arc::new(move |_: &Message| -> CallbackResult {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        client.subscribe("/foo/**", callback).await.unwrap();
        server.deliver("/bar", json!(1));
        server.deliver("/foo", json!(2));
        server.deliver("/foo/a/b", json!(3));

        assert!(wait_until(|| calls.load(Ordering::SeqCst) == 2).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
