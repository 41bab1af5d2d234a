//! Builder pattern for client configuration.
//!
//! Provides a fluent API for configuring and creating [`Client`] instances.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use dbrpc::Client;
//!
//! # fn example() -> dbrpc::Result<()> {
//! let client = Client::builder()
//!     .rpc_timeout(Duration::from_secs(10))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Engine, EngineConfig, WebSocketEngineOptions};
use crate::error::{Error, Result};
use crate::protocol::{BasicValidator, Formatter, JsonFormatter, Validator};
use crate::transport::{Fetcher, ReqwestFetcher, SocketFactory, TungsteniteFactory};

use super::core::{Client, ClientParts};
use super::options::ClientOptions;
use super::registry::EngineRegistry;

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`Client`] instance.
///
/// Use [`Client::builder()`] to create a new builder.
#[derive(Debug, Default, Clone)]
pub struct ClientBuilder {
    /// Wire encoding. Defaults to JSON.
    formatter: Option<Arc<dyn Formatter>>,
    /// Payload validation. Defaults to [`BasicValidator`].
    validator: Option<Arc<dyn Validator>>,
    /// HTTP transport. Defaults to `reqwest`.
    fetcher: Option<Arc<dyn Fetcher>>,
    /// Socket transport. Defaults to `tokio-tungstenite`.
    sockets: Option<Arc<dyn SocketFactory>>,
    /// WebSocket engine tuning.
    websocket: WebSocketEngineOptions,
    /// Default timeouts.
    options: ClientOptions,
    /// Entries layered over the built-in engines.
    engines: EngineRegistry,
}

// ============================================================================
// ClientBuilder Implementation
// ============================================================================

impl ClientBuilder {
    /// Creates a new builder with the default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the wire formatter.
    #[inline]
    #[must_use]
    pub fn formatter(mut self, formatter: impl Formatter + 'static) -> Self {
        self.formatter = Some(Arc::new(formatter));
        self
    }

    /// Sets the payload validator.
    #[inline]
    #[must_use]
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Sets the transport used by the HTTP engine.
    #[inline]
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Sets the socket factory used by the WebSocket engine.
    #[inline]
    #[must_use]
    pub fn socket_factory(mut self, sockets: Arc<dyn SocketFactory>) -> Self {
        self.sockets = Some(sockets);
        self
    }

    /// Sets how long the WebSocket engine waits for a socket to open.
    #[inline]
    #[must_use]
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.websocket = self.websocket.with_open_timeout(timeout);
        self
    }

    /// Replaces all default timeouts.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the default connect timeout.
    #[inline]
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_connect_timeout(timeout);
        self
    }

    /// Sets the default disconnect timeout.
    #[inline]
    #[must_use]
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_disconnect_timeout(timeout);
        self
    }

    /// Sets the default RPC timeout.
    #[inline]
    #[must_use]
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_rpc_timeout(timeout);
        self
    }

    /// Registers an engine for `scheme`, overriding any built-in one.
    #[must_use]
    pub fn engine<F>(mut self, scheme: impl Into<String>, factory: F) -> Self
    where
        F: Fn(EngineConfig) -> Arc<dyn Engine> + Send + Sync + 'static,
    {
        self.engines.register(scheme, factory);
        self
    }

    /// Makes `scheme` use the engine registered for `target`.
    #[must_use]
    pub fn engine_alias(mut self, scheme: impl Into<String>, target: impl Into<String>) -> Self {
        self.engines.alias(scheme, target);
        self
    }

    /// Builds the client with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if a timeout is zero
    /// - [`Error::Http`] if the default HTTP client cannot be created
    pub fn build(self) -> Result<Client> {
        self.validate_timeouts()?;

        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(ReqwestFetcher::new()?),
        };
        let sockets = self
            .sockets
            .unwrap_or_else(|| Arc::new(TungsteniteFactory) as Arc<dyn SocketFactory>);

        let mut registry = EngineRegistry::with_defaults(fetcher, sockets, self.websocket);
        registry.extend(self.engines);

        Ok(Client::new(ClientParts {
            registry,
            formatter: self
                .formatter
                .unwrap_or_else(|| Arc::new(JsonFormatter) as Arc<dyn Formatter>),
            validator: self
                .validator
                .unwrap_or_else(|| Arc::new(BasicValidator) as Arc<dyn Validator>),
            options: self.options,
        }))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ClientBuilder {
    /// Rejects timeouts that would fail every call.
    fn validate_timeouts(&self) -> Result<()> {
        let timeouts = [
            ("connect", self.options.connect_timeout),
            ("disconnect", self.options.disconnect_timeout),
            ("rpc", self.options.rpc_timeout),
            ("open", self.websocket.open_timeout),
        ];

        for (name, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(Error::config(format!(
                    "The {name} timeout must be greater than zero.\n\
                     Example: Client::builder().{name}_timeout(Duration::from_secs(5))"
                )));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
