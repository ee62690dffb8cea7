//! Bayeux message and advice types.
//!
//! Every exchange with the server is a JSON array of messages. Requests are
//! built with the constructors on [`Message`]; replies and deliveries are
//! decoded with [`decode_batch`].
//!
//! # Format
//!
//! ```json
//! [{
//!   "channel": "/meta/subscribe",
//!   "id": "3f2c…",
//!   "clientId": "abc123",
//!   "subscription": "/foo/**"
//! }]
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::{ClientId, MessageId};

use super::channel::{self, Channel, meta};

// ============================================================================
// Constants
// ============================================================================

/// Protocol version sent in the handshake.
pub const BAYEUX_VERSION: &str = "1.0";

/// Lowest protocol version this client accepts.
pub const MINIMUM_VERSION: &str = "1.0";

// ============================================================================
// Reconnect
// ============================================================================

/// Server guidance on what to do after a connect cycle ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    /// Re-issue `/meta/connect` with the current client id.
    Retry,
    /// Discard the client id and handshake again.
    Handshake,
    /// Stop all automatic reconnection.
    None,
}

// ============================================================================
// Advice
// ============================================================================

/// Server-issued reconnect policy.
///
/// Every field is optional on the wire. [`Advice::merge`] applies the
/// "absence keeps the prior value" rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    /// What to do after the current connect cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,

    /// Minimum delay before the next request, in milliseconds.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_millis"
    )]
    pub interval: Option<u64>,

    /// Server-side long-poll hold time, in milliseconds.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_millis"
    )]
    pub timeout: Option<u64>,
}

impl Advice {
    /// Creates advice with every field set.
    #[inline]
    #[must_use]
    pub const fn new(reconnect: Reconnect, interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            reconnect: Some(reconnect),
            interval: Some(interval_ms),
            timeout: Some(timeout_ms),
        }
    }

    /// Overlays the fields present in `newer` onto `self`.
    pub fn merge(&mut self, newer: &Advice) {
        if newer.reconnect.is_some() {
            self.reconnect = newer.reconnect;
        }
        if newer.interval.is_some() {
            self.interval = newer.interval;
        }
        if newer.timeout.is_some() {
            self.timeout = newer.timeout;
        }
    }

    /// Returns the advised reconnect action, defaulting to retry.
    #[inline]
    #[must_use]
    pub fn reconnect(&self) -> Reconnect {
        self.reconnect.unwrap_or(Reconnect::Retry)
    }

    /// Returns the advised minimum delay.
    #[inline]
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval.unwrap_or(0))
    }

    /// Returns the advised long-poll hold time.
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.unwrap_or(0))
    }

    /// Returns `true` if the server forbids further reconnection.
    #[inline]
    #[must_use]
    pub fn forbids_reconnect(&self) -> bool {
        self.reconnect == Some(Reconnect::None)
    }
}

/// Accepts integer or floating point millisecond values.
fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.filter(|v| v.is_finite()).map(|v| v.max(0.0) as u64))
}

// ============================================================================
// Message
// ============================================================================

/// A single Bayeux message.
///
/// Absent fields are omitted on the wire. `successful` is tri-state:
/// `None` on requests and deliveries, `Some(_)` on replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Channel the message is addressed to.
    pub channel: String,

    /// Correlation token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,

    /// Session identifier (absent before handshake).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,

    /// Application payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Extension-owned namespace.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub ext: Map<String, Value>,

    /// Server reconnect policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,

    /// Reply outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,

    /// Failure reason, present when `successful` is `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Pattern carried by subscribe and unsubscribe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,

    /// Protocol version (handshake).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Lowest acceptable protocol version (handshake).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,

    /// Transports offered or accepted (handshake).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,

    /// Transport in use (connect).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
}

// ============================================================================
// Constructors
// ============================================================================

impl Message {
    /// Creates a request on `channel` with a fresh id.
    #[inline]
    #[must_use]
    fn request(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            id: Some(MessageId::generate()),
            ..Default::default()
        }
    }

    /// Creates a `/meta/handshake` request offering `connection_types`.
    #[must_use]
    pub fn handshake(connection_types: &[String]) -> Self {
        Self {
            version: Some(BAYEUX_VERSION.to_string()),
            minimum_version: Some(MINIMUM_VERSION.to_string()),
            supported_connection_types: Some(connection_types.to_vec()),
            ..Self::request(meta::HANDSHAKE)
        }
    }

    /// Creates a `/meta/connect` request.
    #[must_use]
    pub fn connect(client_id: &ClientId, connection_type: &str) -> Self {
        Self {
            client_id: Some(client_id.clone()),
            connection_type: Some(connection_type.to_string()),
            ..Self::request(meta::CONNECT)
        }
    }

    /// Creates a `/meta/subscribe` request.
    #[must_use]
    pub fn subscribe(client_id: &ClientId, subscription: &Channel) -> Self {
        Self {
            client_id: Some(client_id.clone()),
            subscription: Some(subscription.as_str().to_string()),
            ..Self::request(meta::SUBSCRIBE)
        }
    }

    /// Creates a `/meta/unsubscribe` request.
    #[must_use]
    pub fn unsubscribe(client_id: &ClientId, subscription: &Channel) -> Self {
        Self {
            client_id: Some(client_id.clone()),
            subscription: Some(subscription.as_str().to_string()),
            ..Self::request(meta::UNSUBSCRIBE)
        }
    }

    /// Creates a `/meta/disconnect` request.
    #[must_use]
    pub fn disconnect(client_id: &ClientId) -> Self {
        Self {
            client_id: Some(client_id.clone()),
            ..Self::request(meta::DISCONNECT)
        }
    }

    /// Creates a publish request carrying `data`.
    #[must_use]
    pub fn publish(channel: &Channel, client_id: &ClientId, data: Value) -> Self {
        Self {
            client_id: Some(client_id.clone()),
            data: Some(data),
            ..Self::request(channel.as_str())
        }
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl Message {
    /// Returns `true` for messages on `/meta/` channels.
    #[inline]
    #[must_use]
    pub fn is_meta(&self) -> bool {
        channel::is_meta(&self.channel)
    }

    /// Returns `true` if this is a reply rather than a delivery.
    ///
    /// Meta messages and anything carrying `successful` are replies;
    /// deliveries carry neither.
    #[inline]
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.is_meta() || self.successful.is_some()
    }

    /// Returns `true` if the server reported success.
    #[inline]
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.successful == Some(true)
    }

    /// Returns the failure reason, or a generic one if the server sent none.
    #[must_use]
    pub fn failure_reason(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "server gave no reason".to_string())
    }

    /// Parses the Bayeux error string, if any.
    #[must_use]
    pub fn bayeux_error(&self) -> Option<BayeuxError> {
        self.error.as_deref().map(BayeuxError::parse)
    }

    /// Lists structural problems that would make the server reject this
    /// request.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if let Err(err) = Channel::parse(self.channel.as_str()) {
            problems.push(err.to_string());
        }

        let is_subscription = self.channel == meta::SUBSCRIBE || self.channel == meta::UNSUBSCRIBE;
        if is_subscription && self.subscription.is_none() {
            problems.push(format!("{} requires a subscription", self.channel));
        }

        if self.is_meta() && self.id.is_none() {
            problems.push(format!("{} requires an id", self.channel));
        }

        if self.channel != meta::HANDSHAKE && self.client_id.is_none() {
            problems.push(format!("{} requires a clientId", self.channel));
        }

        problems
    }
}

// ============================================================================
// BayeuxError
// ============================================================================

/// Classification of a Bayeux error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 401: unknown or expired client.
    Unauthorized,
    /// 403: operation refused.
    Forbidden,
    /// 405: channel not allowed.
    InvalidChannel,
    /// 409: connection failed.
    ConnectionFailed,
    /// Anything else.
    Other,
}

/// A parsed `code:args:message` error string.
///
/// Strings that do not follow the format are kept whole in `message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BayeuxError {
    /// Numeric code, if present.
    pub code: Option<u16>,
    /// Comma-separated arguments.
    pub args: Vec<String>,
    /// Human-readable text.
    pub message: String,
}

impl BayeuxError {
    /// Parses an error string such as `"405:/foo:Invalid channel"`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.splitn(3, ':');
        let code = parts.next().and_then(|c| c.trim().parse::<u16>().ok());

        match (code, parts.next(), parts.next()) {
            (Some(code), Some(args), Some(message)) => Self {
                code: Some(code),
                args: args
                    .split(',')
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect(),
                message: message.to_string(),
            },
            _ => Self {
                code: None,
                args: Vec::new(),
                message: raw.to_string(),
            },
        }
    }

    /// Classifies the error code.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self.code {
            Some(401) => ErrorKind::Unauthorized,
            Some(403) => ErrorKind::Forbidden,
            Some(405) => ErrorKind::InvalidChannel,
            Some(409) => ErrorKind::ConnectionFailed,
            _ => ErrorKind::Other,
        }
    }
}

// ============================================================================
// Batch Codec
// ============================================================================

/// Encodes messages as a JSON array.
///
/// # Errors
///
/// Returns [`Error::Json`] if a payload cannot be serialized.
pub fn encode_batch(messages: &[Message]) -> Result<String> {
    Ok(serde_json::to_string(messages)?)
}

/// Decodes a JSON array of messages, or a single message object.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the text is neither.
pub fn decode_batch(text: &str) -> Result<Vec<Message>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::protocol(format!("invalid JSON from server: {e}")))?;
    decode_value(value)
}

/// Decodes an already-parsed JSON value into messages.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the value is not a message or array of
/// messages.
pub fn decode_value(value: Value) -> Result<Vec<Message>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item)
                    .map_err(|e| Error::protocol(format!("malformed message: {e}")))
            })
            .collect(),
        Value::Object(_) => serde_json::from_value(value)
            .map(|message| vec![message])
            .map_err(|e| Error::protocol(format!("malformed message: {e}"))),
        other => Err(Error::protocol(format!(
            "expected message array, got {other}"
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================
