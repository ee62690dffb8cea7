//! Channel names and subscription patterns.
//!
//! Bayeux channels are `/`-separated segment paths. Segments are built from
//! alphanumerics and the mark characters `- _ ! ~ ( ) $ @`. Patterns may end
//! with a wildcard segment:
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `/foo/*` | exactly one segment below `/foo` |
//! | `/foo/**` | `/foo` and anything below it, at any depth |
//!
//! Channels under `/meta/` carry protocol control messages and channels
//! under `/service/` address the server directly; neither may be used for
//! subscribe or publish.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Prefix reserved for protocol control channels.
pub const META_PREFIX: &str = "/meta/";

/// Prefix reserved for server-addressed service channels.
pub const SERVICE_PREFIX: &str = "/service/";

/// Single-segment wildcard.
pub const WILDCARD: &str = "*";

/// Any-depth wildcard.
pub const DEEP_WILDCARD: &str = "**";

/// Meta channel names.
pub mod meta {
    /// Handshake request/response.
    pub const HANDSHAKE: &str = "/meta/handshake";
    /// Long-lived connect request.
    pub const CONNECT: &str = "/meta/connect";
    /// Subscribe request.
    pub const SUBSCRIBE: &str = "/meta/subscribe";
    /// Unsubscribe request.
    pub const UNSUBSCRIBE: &str = "/meta/unsubscribe";
    /// Disconnect request.
    pub const DISCONNECT: &str = "/meta/disconnect";
}

/// Valid characters of a non-wildcard segment.
static SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-_!~()$@]+$").expect("segment pattern is valid"));

// ============================================================================
// Channel
// ============================================================================

/// A validated channel name or subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(String);

impl Channel {
    /// Parses a channel against the Bayeux grammar only.
    ///
    /// Meta and service channels are accepted here; use
    /// [`Channel::for_subscribe`] or [`Channel::for_publish`] for
    /// user-facing operations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidChannel`] if the name is empty, does not start
    /// with `/`, contains an empty segment, contains an illegal character,
    /// or uses a wildcard anywhere but the trailing segment.
    pub fn parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(Error::invalid_channel(name, "channel name cannot be empty"));
        }
        if !name.starts_with('/') {
            return Err(Error::invalid_channel(name, "channel name must start with /"));
        }

        let segments: Vec<&str> = name[1..].split('/').collect();
        let last = segments.len() - 1;

        for (index, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(Error::invalid_channel(
                    name.as_str(),
                    "channel segments cannot be empty",
                ));
            }

            if segment.contains('*') {
                if *segment != WILDCARD && *segment != DEEP_WILDCARD {
                    return Err(Error::invalid_channel(
                        name.as_str(),
                        "wildcards must be a whole segment",
                    ));
                }
                if index != last {
                    return Err(Error::invalid_channel(
                        name.as_str(),
                        "wildcards are only allowed as the trailing segment",
                    ));
                }
                continue;
            }

            if !SEGMENT.is_match(segment) {
                return Err(Error::invalid_channel(
                    name.as_str(),
                    format!("segment '{segment}' contains invalid characters"),
                ));
            }
        }

        Ok(Self(name))
    }

    /// Parses a pattern a client may subscribe to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidChannel`] for grammar violations and for
    /// meta or service channels.
    pub fn for_subscribe(name: impl Into<String>) -> Result<Self> {
        let channel = Self::parse(name)?;
        if channel.is_meta() || channel.is_service() {
            return Err(Error::invalid_channel(
                channel.0,
                "cannot subscribe to meta or service channels",
            ));
        }
        Ok(channel)
    }

    /// Parses a channel a client may publish to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidChannel`] for grammar violations, for meta or
    /// service channels and for wildcard patterns.
    pub fn for_publish(name: impl Into<String>) -> Result<Self> {
        let channel = Self::parse(name)?;
        if channel.is_meta() || channel.is_service() {
            return Err(Error::invalid_channel(
                channel.0,
                "cannot publish to meta or service channels",
            ));
        }
        if channel.is_wildcard() {
            return Err(Error::invalid_channel(
                channel.0,
                "cannot publish to a wildcard pattern",
            ));
        }
        Ok(channel)
    }

    /// Returns the channel as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the segments without the leading empty one.
    #[inline]
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }

    /// Returns `true` for `/meta/**` channels.
    #[inline]
    #[must_use]
    pub fn is_meta(&self) -> bool {
        is_meta(&self.0)
    }

    /// Returns `true` for `/service/**` channels.
    #[inline]
    #[must_use]
    pub fn is_service(&self) -> bool {
        self.0.starts_with(SERVICE_PREFIX)
    }

    /// Returns `true` if the trailing segment is `*` or `**`.
    #[inline]
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0.ends_with("/*") || self.0.ends_with("/**")
    }

    /// Returns `true` if `channel` is matched by this pattern.
    ///
    /// A pattern without wildcards matches only itself.
    #[must_use]
    pub fn matches(&self, channel: &str) -> bool {
        matches(&self.0, channel)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Free Functions
// ============================================================================

/// Returns `true` for channel names under `/meta/`.
#[inline]
#[must_use]
pub fn is_meta(channel: &str) -> bool {
    channel.starts_with(META_PREFIX)
}

/// Wildcard match of a concrete `channel` against `pattern`.
#[must_use]
pub fn matches(pattern: &str, channel: &str) -> bool {
    let (Some(pattern), Some(channel)) = (pattern.strip_prefix('/'), channel.strip_prefix('/'))
    else {
        return false;
    };

    let mut pattern_parts = pattern.split('/');
    let mut channel_parts = channel.split('/');

    loop {
        match (pattern_parts.next(), channel_parts.next()) {
            (Some(DEEP_WILDCARD), _) => return true,
            (Some(WILDCARD), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
