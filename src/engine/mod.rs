//! Transport engines.
//!
//! An engine implements `connect`, `disconnect` and `rpc` against one
//! endpoint on top of the shared state machine in [`EngineCore`].
//!
//! # Engines
//!
//! | Engine | Schemes | Correlation | Session state |
//! |--------|---------|-------------|---------------|
//! | [`HttpEngine`] | `http`, `https` | One request, one response | Emulated locally |
//! | [`WebSocketEngine`] | `ws`, `wss` | `<method>/<seq>` ids | Held by the server, mirrored |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | State machine, connection record, lifecycle guard |
//! | `event` | Engine events, keys and error events |
//! | `http` | Stateless request/response engine |
//! | `websocket` | Persistent socket engine |

// ============================================================================
// Submodules
// ============================================================================

/// State machine and connection record.
pub mod core;

/// Engine events.
pub mod event;

/// HTTP engine.
pub mod http;

/// WebSocket engine.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::core::{ConnectionInfo, ConnectionState, EngineCore};
pub use event::{EngineError, EngineEvent, EventKey};
pub use http::HttpEngine;
pub use websocket::{WebSocketEngine, WebSocketEngineOptions};

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::error::Result;
use crate::protocol::{Formatter, RpcRequest, RpcResponse, Validator};
use crate::task::{AbortSignal, TaskEmitter};

// ============================================================================
// Engine
// ============================================================================

/// Outcome of a successful disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnected {
    /// The connection was torn down.
    Disconnected,
    /// There was nothing to tear down.
    AlreadyDisconnected,
}

/// Collaborators handed to an engine by the client.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Emitter shared with the client for this connection.
    pub emitter: TaskEmitter<EngineEvent>,
    /// Wire encoding.
    pub formatter: Arc<dyn Formatter>,
    /// Payload validation.
    pub validator: Arc<dyn Validator>,
}

/// A transport-specific connection to one endpoint.
///
/// `connect` and `disconnect` are serialized per instance; `rpc` calls run
/// concurrently with each other.
#[async_trait]
pub trait Engine: Send + Sync + fmt::Debug {
    /// Returns the engine name used in logs and validation errors.
    fn name(&self) -> &'static str;

    /// Returns the current state.
    fn state(&self) -> ConnectionState;

    /// Returns a snapshot of the connection record.
    fn connection(&self) -> ConnectionInfo;

    /// Connects to `endpoint`. No-op if already open.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established, a state
    /// listener fails, or `signal` aborts.
    async fn connect(&self, endpoint: Url, signal: &AbortSignal) -> Result<()>;

    /// Disconnects.
    ///
    /// # Errors
    ///
    /// Returns an error if a state listener fails or `signal` aborts.
    async fn disconnect(&self, signal: &AbortSignal) -> Result<Disconnected>;

    /// Sends one RPC call and returns its response.
    ///
    /// An RPC-level error is returned as an `Ok` error response.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection is available, the request is
    /// invalid, the transport fails, or `signal` aborts.
    async fn rpc(&self, request: RpcRequest, signal: &AbortSignal) -> Result<RpcResponse>;
}
