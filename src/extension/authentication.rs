//! Token authentication.
//!
//! Adds `{"ext": {"auth": {"token": …}}}` to every handshake and turns an
//! unsuccessful reply carrying `ext.auth_error` into
//! [`Error::Authentication`].

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::protocol::{Message, meta};

use super::{Disposition, Extension};

/// Attaches a token to the handshake.
///
/// The server keeps the authenticated state for the session, so only
/// `/meta/handshake` carries the token.
#[derive(Debug, Clone)]
pub struct AuthenticationExtension {
    token: String,
}

impl AuthenticationExtension {
    /// Creates the extension with `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Extension for AuthenticationExtension {
    fn name(&self) -> &str {
        "authentication"
    }

    async fn outgoing(&self, message: &mut Message) -> Result<Disposition> {
        if message.channel == meta::HANDSHAKE {
            message
                .ext
                .insert("auth".to_string(), json!({ "token": self.token }));
        }
        Ok(Disposition::Continue)
    }

    async fn incoming(&self, message: &mut Message) -> Result<Disposition> {
        if message.is_successful() {
            return Ok(Disposition::Continue);
        }

        match message.ext.get("auth_error") {
            None | Some(Value::Null) => Ok(Disposition::Continue),
            Some(Value::String(reason)) => Err(Error::authentication(reason.as_str())),
            Some(other) => Err(Error::authentication(other.to_string())),
        }
    }
}
