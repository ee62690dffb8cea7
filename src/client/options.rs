//! Client configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use bayeux_client::ClientOptions;
//!
//! let options = ClientOptions::new()
//!     .with_connection_types(["long-polling"])
//!     .with_request_timeout(Duration::from_secs(10))
//!     .with_max_handshake_attempts(None);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::protocol::{Advice, Reconnect};
use crate::transport::{LONG_POLLING, QualityThresholds, TransportOptions, WEBSOCKET};

use super::backoff::BackoffPolicy;

// ============================================================================
// BatchOptions
// ============================================================================

/// Batching limits for outgoing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Flush once this many messages are queued.
    pub max_size: usize,
    /// Flush once the oldest queued message has waited this long.
    pub window: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_size: 32,
            window: Duration::from_millis(10),
        }
    }
}

// ============================================================================
// ClientOptions
// ============================================================================

/// Client behavior settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Connection types in preference order.
    pub connection_types: Vec<String>,

    /// Bound on every request other than `/meta/connect`.
    pub request_timeout: Duration,

    /// Bound on opening a transport.
    pub connect_timeout: Duration,

    /// Retry delays.
    pub backoff: BackoffPolicy,

    /// Failed handshakes tolerated before giving up; `None` retries forever.
    pub max_handshake_attempts: Option<u32>,

    /// Consecutive `/meta/connect` failures that force a new handshake.
    pub reconnect_threshold: u32,

    /// Outgoing batch limits.
    pub batch: BatchOptions,

    /// Advice assumed until the server sends its own.
    pub default_advice: Advice,

    /// Event buffer per subscriber.
    pub event_capacity: usize,

    /// Degradation limits for the active transport.
    pub quality: QualityThresholds,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ClientOptions {
    /// Creates options with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connection_types: vec![WEBSOCKET.to_string(), LONG_POLLING.to_string()],
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            max_handshake_attempts: Some(10),
            reconnect_threshold: 3,
            batch: BatchOptions::default(),
            default_advice: Advice::new(Reconnect::Retry, 0, 60_000),
            event_capacity: 256,
            quality: QualityThresholds::default(),
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ClientOptions {
    /// Sets the connection types in preference order.
    #[must_use]
    pub fn with_connection_types(
        mut self,
        types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.connection_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the request timeout.
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the transport connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the backoff policy.
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the handshake attempt limit.
    #[inline]
    #[must_use]
    pub fn with_max_handshake_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_handshake_attempts = attempts;
        self
    }

    /// Sets the `/meta/connect` failure threshold.
    #[inline]
    #[must_use]
    pub fn with_reconnect_threshold(mut self, threshold: u32) -> Self {
        self.reconnect_threshold = threshold;
        self
    }

    /// Sets the batching limits.
    #[inline]
    #[must_use]
    pub fn with_batch(mut self, batch: BatchOptions) -> Self {
        self.batch = batch;
        self
    }

    /// Sets the advice assumed before the server sends any.
    #[inline]
    #[must_use]
    pub fn with_default_advice(mut self, advice: Advice) -> Self {
        self.default_advice = advice;
        self
    }

    /// Sets the event buffer size.
    #[inline]
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Sets the transport quality thresholds.
    #[inline]
    #[must_use]
    pub fn with_quality(mut self, quality: QualityThresholds) -> Self {
        self.quality = quality;
        self
    }
}

// ============================================================================
// Conversion Methods
// ============================================================================

impl ClientOptions {
    /// Returns the settings handed to transports.
    #[inline]
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: self.connect_timeout,
        }
    }

    /// Validates the options configuration.
    ///
    /// # Errors
    ///
    /// Returns error message if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.connection_types.is_empty() {
            return Err("At least one connection type is required".to_string());
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err("Timeouts must be greater than zero".to_string());
        }
        if self.max_handshake_attempts == Some(0) {
            return Err("max_handshake_attempts must be at least 1 (or None)".to_string());
        }
        if self.reconnect_threshold == 0 {
            return Err("reconnect_threshold must be at least 1".to_string());
        }
        if self.batch.max_size == 0 {
            return Err("Batch size must be at least 1".to_string());
        }
        if self.event_capacity == 0 {
            return Err("Event capacity must be at least 1".to_string());
        }
        self.backoff.validate()?;
        self.quality.validate()?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ClientOptions::new();
        assert_eq!(options.connection_types, vec!["websocket", "long-polling"]);
        assert_eq!(options.request_timeout, Duration::from_secs(30));
        assert_eq!(options.max_handshake_attempts, Some(10));
        assert_eq!(options.batch.max_size, 32);
        assert_eq!(options.default_advice.timeout(), Duration::from_secs(60));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let options = ClientOptions::new()
            .with_connection_types(["long-polling"])
            .with_reconnect_threshold(5)
            .with_max_handshake_attempts(None);

        assert_eq!(options.connection_types, vec!["long-polling"]);
        assert_eq!(options.reconnect_threshold, 5);
        assert_eq!(options.max_handshake_attempts, None);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_connection_types() {
        let options = ClientOptions::new().with_connection_types(Vec::<String>::new());
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let options = ClientOptions::new().with_request_timeout(Duration::ZERO);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_zero_batch() {
        let options = ClientOptions::new().with_batch(BatchOptions {
            max_size: 0,
            window: Duration::from_millis(1),
        });
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_transport_options() {
        let options = ClientOptions::new().with_connect_timeout(Duration::from_secs(3));
        assert_eq!(
            options.transport_options().connect_timeout,
            Duration::from_secs(3)
        );
    }
}
