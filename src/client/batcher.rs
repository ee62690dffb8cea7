//! Outgoing request batching.
//!
//! Subscribe, unsubscribe and publish requests are queued to a single worker
//! that flushes them as one wire batch once `max_size` requests are queued
//! or the oldest has waited `window`, whichever comes first. Batches are
//! flushed one at a time, so submission order is wire order.
//!
//! `/meta/connect` never goes through here.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{Advice, Message};

use super::courier::Courier;
use super::options::BatchOptions;
use super::state::StateView;

// ============================================================================
// Types
// ============================================================================

/// A queued request and its reply slot.
struct Pending {
    message: Message,
    reply_tx: oneshot::Sender<Result<Message>>,
}

/// Running worker of one session.
struct Worker {
    tx: mpsc::UnboundedSender<Pending>,
    handle: JoinHandle<()>,
}

// ============================================================================
// MessageBatcher
// ============================================================================

/// Coalesces outgoing requests into batches.
pub struct MessageBatcher {
    options: BatchOptions,
    request_timeout: Duration,
    courier: Arc<Courier>,
    state: StateView,
    worker: Mutex<Option<Worker>>,
}

impl MessageBatcher {
    pub(crate) fn new(
        options: BatchOptions,
        request_timeout: Duration,
        courier: Arc<Courier>,
        state: StateView,
    ) -> Self {
        Self {
            options,
            request_timeout,
            courier,
            state,
            worker: Mutex::new(None),
        }
    }

    /// Starts the worker for a new session.
    ///
    /// Advice found on replies is forwarded to `advice_tx`.
    pub(crate) fn start(&self, advice_tx: mpsc::UnboundedSender<Advice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::run(
            rx,
            Arc::clone(&self.courier),
            self.options,
            self.request_timeout,
            advice_tx,
        ));

        if let Some(previous) = self.worker.lock().replace(Worker { tx, handle }) {
            previous.handle.abort();
        }
    }

    /// Stops the worker. Queued requests fail.
    pub(crate) fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.handle.abort();
            debug!("Batcher stopped");
        }
    }

    /// Queues one request and waits for its reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if no session is running, or the
    /// failure of the batch the request was sent in.
    pub async fn submit(&self, message: Message) -> Result<Message> {
        let rx = self.enqueue(message)?;
        self.await_reply(rx).await
    }

    /// Queues several requests together and waits for every reply.
    pub async fn submit_all(&self, messages: Vec<Message>) -> Vec<Result<Message>> {
        let mut receivers = Vec::with_capacity(messages.len());
        for message in messages {
            receivers.push(self.enqueue(message));
        }

        let mut results = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            results.push(match receiver {
                Ok(rx) => self.await_reply(rx).await,
                Err(e) => Err(e),
            });
        }
        results
    }

    fn enqueue(&self, message: Message) -> Result<oneshot::Receiver<Result<Message>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let worker = self.worker.lock();
        let sent = worker
            .as_ref()
            .is_some_and(|w| w.tx.send(Pending { message, reply_tx }).is_ok());

        if sent {
            Ok(reply_rx)
        } else {
            Err(Error::not_connected(self.state.state()))
        }
    }

    async fn await_reply(&self, rx: oneshot::Receiver<Result<Message>>) -> Result<Message> {
        rx.await
            .map_err(|_| Error::not_connected(self.state.state()))?
    }

    /// Worker loop.
    async fn run(
        mut rx: mpsc::UnboundedReceiver<Pending>,
        courier: Arc<Courier>,
        options: BatchOptions,
        request_timeout: Duration,
        advice_tx: mpsc::UnboundedSender<Advice>,
    ) {
        while let Some(first) = rx.recv().await {
            let deadline = Instant::now() + options.window;
            let mut batch = vec![first];

            while batch.len() < options.max_size {
                match timeout_at(deadline, rx.recv()).await {
                    Ok(Some(next)) => batch.push(next),
                    Ok(None) | Err(_) => break,
                }
            }

            Self::flush(batch, &courier, request_timeout, &advice_tx).await;
        }

        trace!("Batcher queue closed");
    }

    async fn flush(
        batch: Vec<Pending>,
        courier: &Courier,
        request_timeout: Duration,
        advice_tx: &mpsc::UnboundedSender<Advice>,
    ) {
        let (messages, waiters): (Vec<Message>, Vec<_>) =
            batch.into_iter().map(|p| (p.message, p.reply_tx)).unzip();

        debug!(size = messages.len(), "Flushing batch");

        match courier.send_batch(messages, request_timeout).await {
            Ok(results) => {
                for (result, waiter) in results.into_iter().zip(waiters) {
                    if let Ok(reply) = &result
                        && let Some(advice) = reply.advice
                    {
                        let _ = advice_tx.send(advice);
                    }
                    let _ = waiter.send(result);
                }
            }
            Err(e) => {
                debug!(error = %e, "Batch failed");
                for waiter in waiters {
                    let _ = waiter.send(Err(e.replicate()));
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use url::Url;

    use crate::client::EventSink;
    use crate::client::state::{ConnectionState, StateCell};
    use crate::extension::ExtensionPipeline;
    use crate::identifiers::ClientId;
    use crate::protocol::Channel;
    use crate::transport::testing::FakeServer;
    use crate::transport::{LONG_POLLING, QualityThresholds, TransportManager, TransportOptions};

    async fn batcher(server: &FakeServer, options: BatchOptions) -> (MessageBatcher, StateCell) {
        let events = EventSink::new(8);
        let manager = TransportManager::new(
            server.registry(),
            &[LONG_POLLING.to_string()],
            Url::parse("http://localhost/faye").unwrap(),
            TransportOptions::default(),
            QualityThresholds::default(),
            events.clone(),
        )
        .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.begin_session(tx);
        manager.establish().await.unwrap();

        let courier = Arc::new(Courier::new(
            Arc::new(ExtensionPipeline::new(events.clone())),
            Arc::new(manager),
        ));
        let cell = StateCell::new(events);
        let batcher = MessageBatcher::new(options, Duration::from_secs(1), courier, cell.view());
        (batcher, cell)
    }

    fn subscribe(pattern: &str) -> Message {
        Message::subscribe(&ClientId::from("c1"), &Channel::parse(pattern).unwrap())
    }

    #[tokio::test]
    async fn test_submit_without_worker_is_not_connected() {
        let server = FakeServer::new();
        let (batcher, cell) = batcher(&server, BatchOptions::default()).await;
        cell.fail("gone");

        let err = batcher.submit(subscribe("/a")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::NotConnected {
                state: ConnectionState::Disconnected
            }
        ));
    }

    #[tokio::test]
    async fn test_requests_coalesce_into_one_batch() {
        let server = FakeServer::new();
        let (batcher, _cell) = batcher(
            &server,
            BatchOptions {
                max_size: 32,
                window: Duration::from_millis(50),
            },
        )
        .await;
        let (advice_tx, _advice_rx) = mpsc::unbounded_channel();
        batcher.start(advice_tx);

        let results = batcher
            .submit_all(vec![subscribe("/a"), subscribe("/b"), subscribe("/c")])
            .await;

        assert!(results.iter().all(|r| r.as_ref().unwrap().is_successful()));
        assert_eq!(server.batch_sizes(), vec![3]);
    }

    #[tokio::test]
    async fn test_size_threshold_splits_batches() {
        let server = FakeServer::new();
        let (batcher, _cell) = batcher(
            &server,
            BatchOptions {
                max_size: 2,
                window: Duration::from_millis(50),
            },
        )
        .await;
        let (advice_tx, _advice_rx) = mpsc::unbounded_channel();
        batcher.start(advice_tx);

        let results = batcher
            .submit_all(vec![subscribe("/a"), subscribe("/b"), subscribe("/c")])
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(server.batch_sizes(), vec![2, 1]);

        let order: Vec<String> = server
            .received_on("/meta/subscribe")
            .into_iter()
            .filter_map(|m| m.subscription)
            .collect();
        assert_eq!(order, vec!["/a", "/b", "/c"]);
    }

    #[tokio::test]
    async fn test_batch_failure_reaches_every_waiter() {
        let server = FakeServer::new();
        let (batcher, _cell) = batcher(&server, BatchOptions::default()).await;
        let (advice_tx, _advice_rx) = mpsc::unbounded_channel();
        batcher.start(advice_tx);

        server.fail_sends(true);
        let results = batcher.submit_all(vec![subscribe("/a"), subscribe("/b")]).await;
        assert!(results.iter().all(|r| r.as_ref().unwrap_err().is_transport_error()));

        batcher.stop();
        assert!(batcher.submit(subscribe("/a")).await.is_err());
    }
}
