//! dbrpc - Async client driver for a remote database's RPC protocol.
//!
//! Method calls travel over either a stateless HTTP transport or a
//! persistent WebSocket. The client picks the transport from the endpoint's
//! URL scheme and hides the difference: session state (namespace, database,
//! variables, token) behaves the same on both.
//!
//! # Architecture
//!
//! ```text
//! Client ──► Engine (HTTP | WebSocket) ──► Fetcher | SocketFactory
//!    │          │
//!    └──────────┴──► TaskEmitter<EngineEvent> ──► listener tasks (TaskQueue)
//! ```
//!
//! Key design principles:
//!
//! - Each engine owns a state machine (`Closed → Connecting → Open →
//!   Closing → Closed`); a state change returns only after every observer
//!   has finished
//! - `connect` and `disconnect` are serialized per instance, `rpc` calls
//!   run concurrently
//! - Socket responses are correlated by `<method>/<seq>` ids, not by
//!   arrival order
//! - Every wait accepts an [`AbortSignal`]; aborting deregisters the waiter
//!
//! # Quick Start
//!
//! ```no_run
//! use dbrpc::{Client, ConnectOptions, DisconnectOptions, Result};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::builder().build()?;
//!     client.connect("ws://localhost:8000", ConnectOptions::default()).await?;
//!
//!     client.use_ns_db(Some("app"), Some("main")).await?;
//!     client.signin(json!({ "user": "root", "pass": "root" })).await?;
//!
//!     let rows = client.query("SELECT * FROM person", None).await?;
//!     println!("{rows}");
//!
//!     client.disconnect(DisconnectOptions::default()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Client`], builder, options, engine registry |
//! | [`engine`] | State machine and the HTTP / WebSocket engines |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | RPC messages, formatter and validator seams |
//! | [`task`] | Abort signals, task queue, task emitter |
//! | [`transport`] | Fetch and socket seams with default implementations |

// ============================================================================
// Modules
// ============================================================================

/// Client entry point and configuration.
///
/// Use [`Client::builder()`] to create a configured client.
pub mod client;

/// Connection engines.
///
/// Each engine implements `connect`, `disconnect` and `rpc` for one
/// transport on top of the shared state machine.
pub mod engine;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for tasks, listeners, requests and live queries.
pub mod identifiers;

/// RPC message types and wire collaborators.
pub mod protocol;

/// Task scheduling substrate.
///
/// Internal coordination primitives, exposed for custom engines.
pub mod task;

/// Network transports.
///
/// Trait seams plus the `reqwest` and `tokio-tungstenite` implementations.
pub mod transport;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{
    Client, ClientBuilder, ClientOptions, ConnectOptions, DisconnectOptions, EngineRegistry,
    LiveSubscription, RpcOptions,
};

// Engine types
pub use engine::{
    ConnectionInfo, ConnectionState, Disconnected, Engine, EngineConfig, EngineError,
    EngineEvent, EventKey, HttpEngine, WebSocketEngine, WebSocketEngineOptions,
};

// Error types
pub use error::{AggregateTasksError, Error, Result, TaskFailure};

// Identifier types
pub use identifiers::{CorrelationId, ListenerId, LiveId, SerialId, TaskId};

// Protocol types
pub use protocol::{
    BasicValidator, Formatter, JsonFormatter, LiveNotification, Payload, RpcError, RpcOutcome,
    RpcRequest, RpcResponse, Validator,
};

// Task types
pub use task::{AbortSignal, Listener, TaskEmitter};
