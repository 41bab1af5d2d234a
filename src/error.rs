//! Error types for the RPC driver.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use dbrpc::{Client, Result};
//!
//! async fn example(client: &Client) -> Result<()> {
//!     client.connect("ws://localhost:8000", Default::default()).await?;
//!     client.use_ns_db(Some("app"), Some("main")).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::UnsupportedProtocol`], [`Error::CircularEngineReference`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionUnavailable`], [`Error::ConnectionConflict`], [`Error::EngineDisconnected`], [`Error::Disconnect`] |
//! | Session | [`Error::MissingNamespace`] |
//! | Protocol | [`Error::InvalidResponse`], [`Error::RpcResponse`], [`Error::Validation`], [`Error::Conversion`], [`Error::Engine`] |
//! | Tasks | [`Error::AggregateTasks`], [`Error::ResourceAlreadyDisposed`], [`Error::TaskPanicked`] |
//! | Cancellation | [`Error::Aborted`], [`Error::Timeout`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Http`], [`Error::Url`] |
//!
//! [`Error`] is `Clone` so that one failure can be delivered to every waiter
//! of a shared task or abort signal. Third-party sources are kept behind [`Arc`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io::Error as IoError;
use std::result::Result as StdResult;
use std::sync::Arc;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use url::Url;

use crate::engine::EngineError;
use crate::identifiers::TaskId;
use crate::protocol::RpcResponse;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// No engine is registered for the endpoint scheme.
    #[error("Unsupported protocol: {protocol}")]
    UnsupportedProtocol {
        /// The URL scheme without the trailing `:`.
        protocol: String,
    },

    /// Engine aliases form a cycle.
    #[error("Circular engine reference: {}", .chain.join(" -> "))]
    CircularEngineReference {
        /// Schemes visited while resolving, in order.
        chain: Vec<String>,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection could not be established.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection was not established in time.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// No live transport is available for an RPC call.
    #[error("Connection unavailable{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    ConnectionUnavailable {
        /// Optional explanation (e.g. the connection closed while waiting).
        reason: Option<String>,
    },

    /// Connect was requested for a different endpoint while already open.
    #[error("Connection conflict: already connected to {current}, requested {requested}")]
    ConnectionConflict {
        /// The endpoint of the open connection.
        current: Box<Url>,
        /// The endpoint that was requested.
        requested: Box<Url>,
    },

    /// The engine was disconnected while work was in flight.
    #[error("Engine disconnected")]
    EngineDisconnected,

    /// Disconnect finished with residual failures.
    #[error("Disconnect failed: {}", describe_disconnect(.disconnect.as_deref(), .dispose.as_ref()))]
    Disconnect {
        /// Failure of the engine disconnect phase.
        disconnect: Option<Box<Error>>,
        /// Failures collected while disposing the emitter.
        dispose: Option<AggregateTasksError>,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// A database was selected without a namespace.
    #[error("The namespace must be specified before the database")]
    MissingNamespace,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// The HTTP transport returned a malformed or non-success response.
    #[error("Invalid response from {endpoint} ({method}, status {}): {message}", .status.map(|s| s.to_string()).unwrap_or_else(|| "n/a".into()))]
    InvalidResponse {
        /// Description of the problem.
        message: String,
        /// RPC method of the request.
        method: String,
        /// Endpoint the request was sent to.
        endpoint: String,
        /// HTTP status, when one was received.
        status: Option<u16>,
        /// Raw response body as text (lossy).
        body: String,
    },

    /// The server answered with an RPC-level error.
    #[error("RPC error {}: {}", .response.error_code().unwrap_or_default(), .response.error_message().unwrap_or_default())]
    RpcResponse {
        /// The full error response.
        response: Box<RpcResponse>,
    },

    /// A request, response, or result failed shape validation.
    #[error("Validation error ({engine}{}): {message}", .endpoint.as_deref().map(|e| format!(" @ {e}")).unwrap_or_default())]
    Validation {
        /// Description of the validation failure.
        message: String,
        /// Engine that performed validation.
        engine: String,
        /// Endpoint the payload belongs to.
        endpoint: Option<String>,
    },

    /// Data could not be converted between representations.
    #[error("Failed to convert the data from {from} to {to}: {message}")]
    Conversion {
        /// Source representation.
        from: &'static str,
        /// Target representation.
        to: &'static str,
        /// Description of the conversion failure.
        message: String,
    },

    /// Error event raised by an engine.
    #[error("{0}")]
    Engine(EngineError),

    // ========================================================================
    // Task Errors
    // ========================================================================
    /// One or more queued tasks failed.
    #[error("{0}")]
    AggregateTasks(AggregateTasksError),

    /// The resource was already disposed.
    #[error("Resource already disposed: {resource}")]
    ResourceAlreadyDisposed {
        /// Name of the disposed resource.
        resource: &'static str,
    },

    /// A queued task panicked or was cancelled by the runtime.
    #[error("Task panicked: {message}")]
    TaskPanicked {
        /// Panic payload or join error description.
        message: String,
    },

    // ========================================================================
    // Cancellation Errors
    // ========================================================================
    /// Operation was aborted through a signal.
    #[error("Aborted: {message}")]
    Aborted {
        /// Abort reason.
        message: String,
    },

    /// Operation timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<IoError>),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(Arc<WsError>),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(Arc<reqwest::Error>),

    /// URL parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// External Conversions
// ============================================================================

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        Self::WebSocket(Arc::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(Arc::new(err))
    }
}

// ============================================================================
// AggregateTasksError
// ============================================================================

/// A single failed task inside an [`AggregateTasksError`].
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Task that produced the failure.
    pub task: TaskId,
    /// The failure itself.
    pub error: Error,
}

/// Failures of one or more queued tasks.
///
/// Produced by state transitions whose listeners failed and by disposal.
#[derive(Debug, Clone, Default)]
pub struct AggregateTasksError {
    /// Failures in task order.
    pub failures: Vec<TaskFailure>,
}

impl AggregateTasksError {
    /// Creates an aggregate from collected failures.
    #[inline]
    #[must_use]
    pub fn new(failures: Vec<TaskFailure>) -> Self {
        Self { failures }
    }

    /// Returns the number of failures.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Returns `true` if there are no failures.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Iterates over the underlying errors.
    pub fn errors(&self) -> impl Iterator<Item = &Error> {
        self.failures.iter().map(|f| &f.error)
    }
}

impl fmt::Display for AggregateTasksError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; [{}] {}", failure.task, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateTasksError {}

fn describe_disconnect(
    disconnect: Option<&Error>,
    dispose: Option<&AggregateTasksError>,
) -> String {
    match (disconnect, dispose) {
        (Some(d), Some(a)) => format!("disconnect: {d}; dispose: {a}"),
        (Some(d), None) => format!("disconnect: {d}"),
        (None, Some(a)) => format!("dispose: {a}"),
        (None, None) => "unknown".to_string(),
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an unsupported protocol error.
    #[inline]
    pub fn unsupported_protocol(protocol: impl Into<String>) -> Self {
        Self::UnsupportedProtocol {
            protocol: protocol.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a connection unavailable error without a reason.
    #[inline]
    pub fn connection_unavailable() -> Self {
        Self::ConnectionUnavailable { reason: None }
    }

    /// Creates a connection unavailable error with a reason.
    #[inline]
    pub fn connection_unavailable_because(reason: impl Into<String>) -> Self {
        Self::ConnectionUnavailable {
            reason: Some(reason.into()),
        }
    }

    /// Creates a connection conflict error.
    #[inline]
    pub fn connection_conflict(current: Url, requested: Url) -> Self {
        Self::ConnectionConflict {
            current: Box::new(current),
            requested: Box::new(requested),
        }
    }

    /// Creates a validation error.
    #[inline]
    pub fn validation(
        message: impl Into<String>,
        engine: impl Into<String>,
        endpoint: Option<&Url>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            engine: engine.into(),
            endpoint: endpoint.map(Url::to_string),
        }
    }

    /// Creates a conversion error.
    #[inline]
    pub fn conversion(from: &'static str, to: &'static str, message: impl Into<String>) -> Self {
        Self::Conversion {
            from,
            to,
            message: message.into(),
        }
    }

    /// Creates a resource already disposed error.
    #[inline]
    pub fn disposed(resource: &'static str) -> Self {
        Self::ResourceAlreadyDisposed { resource }
    }

    /// Creates an aborted error.
    #[inline]
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates an RPC response error.
    #[inline]
    pub fn rpc_response(response: RpcResponse) -> Self {
        Self::RpcResponse {
            response: Box::new(response),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectionTimeout { .. } | Self::Timeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionUnavailable { .. }
                | Self::ConnectionConflict { .. }
                | Self::EngineDisconnected
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::Timeout { .. }
                | Self::ConnectionUnavailable { .. }
        )
    }

    /// Returns `true` if this is a fatal engine error event.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Engine(e) if e.fatal)
    }
}

// ============================================================================
// Tests
// ============================================================================
