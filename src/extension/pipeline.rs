//! Ordered hook execution with failure isolation.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::client::{ClientEvent, Direction, EventSink};
use crate::protocol::Message;

use super::{Disposition, Extension};

// ============================================================================
// ExtensionPipeline
// ============================================================================

/// Registered extensions and the rules for running them.
///
/// Outgoing hooks run in registration order, incoming hooks in reverse.
/// A hook error restores the message to its state before that hook, emits
/// [`ClientEvent::ExtensionFailed`] and lets the chain continue. A
/// [`Disposition::Drop`] halts the chain.
pub struct ExtensionPipeline {
    extensions: RwLock<Vec<Arc<dyn Extension>>>,
    events: EventSink,
}

impl ExtensionPipeline {
    /// Creates an empty pipeline reporting to `events`.
    #[must_use]
    pub fn new(events: EventSink) -> Self {
        Self {
            extensions: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Appends an extension.
    pub fn add(&self, extension: Arc<dyn Extension>) {
        debug!(extension = extension.name(), "Extension registered");
        self.extensions.write().push(extension);
    }

    /// Returns the number of registered extensions.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.extensions.read().len()
    }

    /// Returns `true` if no extension is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.read().is_empty()
    }

    /// Runs outgoing hooks. Returns `None` if the message was dropped.
    pub async fn outgoing(&self, message: Message) -> Option<Message> {
        self.run(message, Direction::Outgoing).await
    }

    /// Runs incoming hooks. Returns `None` if the message was dropped.
    pub async fn incoming(&self, message: Message) -> Option<Message> {
        self.run(message, Direction::Incoming).await
    }

    async fn run(&self, mut message: Message, direction: Direction) -> Option<Message> {
        let mut chain: Vec<Arc<dyn Extension>> = self.extensions.read().clone();
        if chain.is_empty() {
            return Some(message);
        }
        if direction == Direction::Incoming {
            chain.reverse();
        }

        for extension in chain {
            let before = message.clone();
            let outcome = match direction {
                Direction::Outgoing => extension.outgoing(&mut message).await,
                Direction::Incoming => extension.incoming(&mut message).await,
            };

            match outcome {
                Ok(Disposition::Continue) => {}
                Ok(Disposition::Drop) => {
                    debug!(
                        extension = extension.name(),
                        channel = %message.channel,
                        %direction,
                        "Message dropped by extension"
                    );
                    self.events.emit(ClientEvent::MessageDropped {
                        channel: message.channel,
                        direction,
                    });
                    return None;
                }
                Err(e) => {
                    warn!(
                        extension = extension.name(),
                        channel = %before.channel,
                        %direction,
                        error = %e,
                        "Extension failed"
                    );
                    self.events.emit(ClientEvent::ExtensionFailed {
                        extension: extension.name().to_string(),
                        direction,
                        reason: e.to_string(),
                    });
                    message = before;
                }
            }
        }

        Some(message)
    }
}

// ============================================================================
// Tests
// ============================================================================
