//! Engine events and their keys.
//!
//! Every engine communicates through one [`TaskEmitter<EngineEvent>`]:
//!
//! | Event | Key | Emitted when |
//! |-------|-----|--------------|
//! | `State(s)` | `State(s)` | The state machine enters `s` |
//! | `Rpc(id, response)` | `Rpc(id)` | A correlated socket response arrives |
//! | `Live(notification)` | `Live(id)` | A live query push arrives |
//! | `Error(e)` | `Error` | The transport reports a problem |
//!
//! [`TaskEmitter<EngineEvent>`]: crate::task::TaskEmitter

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::error::Error;
use crate::identifiers::{CorrelationId, LiveId};
use crate::protocol::{LiveNotification, RpcResponse};
use crate::task::Event;

use super::ConnectionState;

// ============================================================================
// EventKey
// ============================================================================

/// Key under which engine listeners and waiters register.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// A state transition.
    State(ConnectionState),
    /// The response to one correlated socket request.
    Rpc(CorrelationId),
    /// Notifications for one live query.
    Live(LiveId),
    /// Transport errors.
    Error,
}

// ============================================================================
// EngineEvent
// ============================================================================

/// Event emitted by an engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The state machine entered a state.
    State(ConnectionState),
    /// A correlated response arrived.
    Rpc(CorrelationId, RpcResponse),
    /// A live query notification arrived.
    Live(LiveNotification),
    /// The transport reported an error.
    Error(EngineError),
}

impl Event for EngineEvent {
    type Key = EventKey;

    fn key(&self) -> Self::Key {
        match self {
            Self::State(state) => EventKey::State(*state),
            Self::Rpc(id, _) => EventKey::Rpc(id.clone()),
            Self::Live(notification) => EventKey::Live(notification.id),
            Self::Error(_) => EventKey::Error,
        }
    }
}

// ============================================================================
// EngineError
// ============================================================================

/// Error event raised by an engine.
///
/// Fatal errors leave the transport unusable; the owning client reacts by
/// force-disconnecting. Non-fatal errors only drop the affected frame or
/// report an unusual close.
#[derive(Debug, Clone)]
pub struct EngineError {
    /// Close code or one of the engine codes below.
    pub code: u16,
    /// Description.
    pub message: String,
    /// Whether the transport is unusable.
    pub fatal: bool,
    /// Underlying failure.
    pub cause: Option<Box<Error>>,
}

impl EngineError {
    /// The socket reported an error.
    pub const SOCKET_ERROR: u16 = 3000;

    /// Entering `Open` failed.
    pub const OPEN_HANDLER: u16 = 3001;

    /// An incoming frame could not be handled.
    pub const MESSAGE_HANDLER: u16 = 3002;

    /// Creates a fatal error.
    #[inline]
    #[must_use]
    pub fn fatal(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: true,
            cause: None,
        }
    }

    /// Creates a non-fatal error.
    #[inline]
    #[must_use]
    pub fn non_fatal(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: false,
            cause: None,
        }
    }

    /// Attaches the underlying failure.
    #[inline]
    #[must_use]
    pub fn with_cause(mut self, cause: Error) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.fatal { "Fatal engine error" } else { "Engine error" };
        write!(f, "{kind} {}: {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
