//! Builder pattern for client configuration.
//!
//! Provides a fluent API for configuring and creating [`Client`] instances.
//!
//! # Example
//!
//! ```no_run
//! use bayeux_client::{AuthenticationExtension, Client, ClientOptions};
//!
//! # fn example() -> bayeux_client::Result<()> {
//! let client = Client::builder("https://push.example.com/faye")
//!     .options(ClientOptions::new().with_connection_types(["long-polling"]))
//!     .extension(AuthenticationExtension::new("secret"))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::error::{Error, Result};
use crate::extension::Extension;
use crate::transport::{Transport, TransportRegistry};

use super::core::Client;
use super::options::ClientOptions;

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`Client`] instance.
///
/// Use [`Client::builder()`] to create a new builder.
#[derive(Clone)]
pub struct ClientBuilder {
    /// Server endpoint.
    url: String,
    /// Behavior settings.
    options: ClientOptions,
    /// Extensions in registration order.
    extensions: Vec<Arc<dyn Extension>>,
    /// Available transports.
    registry: TransportRegistry,
}

// ============================================================================
// ClientBuilder Implementation
// ============================================================================

impl ClientBuilder {
    /// Creates a builder for the server at `url` with default settings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: ClientOptions::default(),
            extensions: Vec::new(),
            registry: TransportRegistry::with_defaults(),
        }
    }

    /// Replaces the behavior settings.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Appends an extension. Outgoing hooks run in registration order,
    /// incoming hooks in reverse.
    #[must_use]
    pub fn extension(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    /// Registers (or replaces) a transport constructor.
    ///
    /// # Arguments
    ///
    /// * `name` - Connection type advertised in the handshake
    /// * `factory` - Creates a fresh, unconnected transport
    #[must_use]
    pub fn register_transport<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Transport> + Send + Sync + 'static,
    {
        self.registry = self.registry.with(name, factory);
        self
    }

    /// Replaces the whole transport registry.
    #[inline]
    #[must_use]
    pub fn transports(mut self, registry: TransportRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Builds the client with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the URL is malformed or has an unsupported scheme
    /// - [`Error::Config`] if an option is out of range
    /// - [`Error::Config`] if a connection type has no registered transport
    pub fn build(self) -> Result<Client> {
        let url = self.validate_url()?;
        self.validate_options()?;

        Client::new(url, self.options, self.registry, self.extensions)
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ClientBuilder {
    /// Validates the endpoint URL.
    fn validate_url(&self) -> Result<Url> {
        let url = Url::parse(&self.url).map_err(|e| {
            Error::config(format!(
                "Invalid server URL '{}': {e}\n\
                 Example: Client::builder(\"https://push.example.com/faye\")",
                self.url
            ))
        })?;

        match url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(url),
            scheme => Err(Error::config(format!(
                "Unsupported URL scheme '{scheme}'.\n\
                 Use http, https, ws or wss."
            ))),
        }
    }

    /// Validates the behavior settings.
    fn validate_options(&self) -> Result<()> {
        self.options
            .validate()
            .map_err(|e| Error::config(format!("{e}\nAdjust the value in ClientOptions.")))
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let extensions: Vec<&str> = self.extensions.iter().map(|e| e.name()).collect();
        f.debug_struct("ClientBuilder")
            .field("url", &self.url)
            .field("options", &self.options)
            .field("extensions", &extensions)
            .field("registry", &self.registry)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::extension::LoggingExtension;
    use crate::transport::LongPollingTransport;

    #[test]
    fn test_new_uses_defaults() {
        let builder = ClientBuilder::new("http://localhost/faye");
        assert_eq!(builder.url, "http://localhost/faye");
        assert_eq!(builder.options, ClientOptions::default());
        assert!(builder.extensions.is_empty());
        assert_eq!(builder.registry.names(), vec!["websocket", "long-polling"]);
    }

    #[test]
    fn test_extension_appends_in_order() {
        let builder = ClientBuilder::new("http://localhost/faye")
            .extension(LoggingExtension::new())
            .extension(LoggingExtension::new());
        assert_eq!(builder.extensions.len(), 2);
    }

    #[test]
    fn test_register_transport_adds_name() {
        let builder = ClientBuilder::new("http://localhost/faye")
            .register_transport("custom", || Box::new(LongPollingTransport::new()));
        assert!(builder.registry.contains("custom"));
    }

    #[test]
    fn test_build_rejects_malformed_url() {
        let err = ClientBuilder::new("not a url").build().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("Invalid server URL"));
    }

    #[test]
    fn test_build_rejects_unsupported_scheme() {
        let err = ClientBuilder::new("ftp://localhost/faye").build().unwrap_err();
        assert!(err.to_string().contains("ftp"));
    }

    #[test]
    fn test_build_rejects_invalid_options() {
        let err = ClientBuilder::new("http://localhost/faye")
            .options(ClientOptions::new().with_request_timeout(Duration::ZERO))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_build_rejects_unregistered_connection_type() {
        let err = ClientBuilder::new("http://localhost/faye")
            .options(ClientOptions::new().with_connection_types(["callback-polling"]))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("callback-polling"));
    }

    #[test]
    fn test_build_accepts_every_supported_scheme() {
        for url in [
            "http://localhost/faye",
            "https://localhost/faye",
            "ws://localhost/faye",
            "wss://localhost/faye",
        ] {
            let client = tokio_test::assert_ok!(ClientBuilder::new(url).build());
            assert_eq!(client.state(), crate::client::ConnectionState::Unconnected);
        }
    }
}
