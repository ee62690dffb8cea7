//! Request/reply exchange through extensions and the active transport.
//!
//! ```text
//! messages ─► pipeline.outgoing ─► validate ─► manager.send ─► match by id ─► pipeline.incoming ─► results
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::extension::ExtensionPipeline;
use crate::identifiers::MessageId;
use crate::protocol::Message;
use crate::transport::TransportManager;

// ============================================================================
// Courier
// ============================================================================

/// Sends requests and pairs them with their replies.
pub(crate) struct Courier {
    pipeline: Arc<ExtensionPipeline>,
    manager: Arc<TransportManager>,
}

impl Courier {
    pub(crate) fn new(pipeline: Arc<ExtensionPipeline>, manager: Arc<TransportManager>) -> Self {
        Self { pipeline, manager }
    }

    /// Sends `messages` as one wire batch.
    ///
    /// The outer error is a failure of the whole exchange; the inner results
    /// line up with `messages`.
    pub(crate) async fn send_batch(
        &self,
        messages: Vec<Message>,
        timeout: Duration,
    ) -> Result<Vec<Result<Message>>> {
        let mut results: Vec<Option<Result<Message>>> = Vec::with_capacity(messages.len());
        let mut channels: Vec<String> = Vec::with_capacity(messages.len());
        let mut index_of: FxHashMap<MessageId, usize> = FxHashMap::default();
        let mut outgoing = Vec::with_capacity(messages.len());

        for (index, message) in messages.into_iter().enumerate() {
            channels.push(message.channel.clone());

            let Some(message) = self.pipeline.outgoing(message).await else {
                results.push(Some(Err(Error::message_dropped(channels[index].as_str()))));
                continue;
            };

            let problems = message.validate();
            if !problems.is_empty() {
                results.push(Some(Err(Error::protocol(problems.join("; ")))));
                continue;
            }

            match message.id.clone() {
                Some(id) => {
                    index_of.insert(id, index);
                    outgoing.push(message);
                    results.push(None);
                }
                None => results.push(Some(Err(Error::protocol(format!(
                    "{} has no id",
                    message.channel
                ))))),
            }
        }

        if !outgoing.is_empty() {
            let replies = self.manager.send(outgoing, timeout).await?;

            for reply in replies {
                let Some(index) = reply.id.as_ref().and_then(|id| index_of.remove(id)) else {
                    debug!(channel = %reply.channel, "Unmatched reply ignored");
                    continue;
                };

                let channel = reply.channel.clone();
                results[index] = Some(
                    self.pipeline
                        .incoming(reply)
                        .await
                        .ok_or_else(|| Error::message_dropped(channel)),
                );
            }
        }

        Ok(results
            .into_iter()
            .zip(channels)
            .map(|(result, channel)| {
                result.unwrap_or_else(|| Err(Error::protocol(format!("no reply to {channel}"))))
            })
            .collect())
    }

    /// Sends a single message unbatched.
    pub(crate) async fn send_one(&self, message: Message, timeout: Duration) -> Result<Message> {
        let channel = message.channel.clone();
        self.send_batch(vec![message], timeout)
            .await?
            .pop()
            .unwrap_or_else(|| Err(Error::protocol(format!("no reply to {channel}"))))
    }
}

// ============================================================================
// Tests
// ============================================================================
