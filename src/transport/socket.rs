//! Socket abstraction consumed by the WebSocket engine.
//!
//! A [`SocketFactory`] yields a [`SocketConnection`]: an event stream plus a
//! handle for sending and closing. The engine never touches the underlying
//! WebSocket library directly.
//!
//! # Event Order
//!
//! ```text
//! Open? → Message* → Error? → Close
//! ```
//!
//! Every socket produces exactly one [`SocketEvent::Close`], which is always
//! the last event.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::Result;
use crate::protocol::Payload;

// ============================================================================
// Close Codes
// ============================================================================

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// No status code was present.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

// ============================================================================
// SocketEvent
// ============================================================================

/// Event produced by a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The socket is open.
    Open,
    /// A frame arrived.
    Message(Payload),
    /// The socket failed.
    Error(String),
    /// The socket closed. Always the final event.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

// ============================================================================
// ReadyState
// ============================================================================

/// Socket lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadyState {
    /// Handshake in progress.
    Connecting = 0,
    /// Frames can be sent.
    Open = 1,
    /// Close handshake in progress.
    Closing = 2,
    /// Closed.
    Closed = 3,
}

impl ReadyState {
    /// Returns `true` for `Closing` and `Closed`.
    #[inline]
    #[must_use]
    pub fn is_closing_or_closed(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Lock-free cell holding a [`ReadyState`].
#[derive(Debug)]
pub struct AtomicReadyState(AtomicU8);

impl AtomicReadyState {
    /// Creates a cell holding `state`.
    #[inline]
    #[must_use]
    pub fn new(state: ReadyState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn load(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Stores `state`.
    #[inline]
    pub fn store(&self, state: ReadyState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for AtomicReadyState {
    fn default() -> Self {
        Self::new(ReadyState::Connecting)
    }
}

// ============================================================================
// Socket Traits
// ============================================================================

/// Sending side of an open socket.
pub trait SocketHandle: Send + Sync + fmt::Debug {
    /// Queues a frame for sending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionUnavailable`](crate::Error::ConnectionUnavailable)
    /// if the socket is no longer running.
    fn send(&self, payload: Payload) -> Result<()>;

    /// Starts the close handshake. Idempotent.
    fn close(&self, code: u16, reason: &str);

    /// Returns the current lifecycle state.
    fn ready_state(&self) -> ReadyState;
}

/// A created socket: its events and its handle.
#[derive(Debug)]
pub struct SocketConnection {
    /// Lifecycle and frame events, ending with exactly one `Close`.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
    /// Handle for sending and closing.
    pub handle: Arc<dyn SocketHandle>,
}

/// Creates sockets for the WebSocket engine.
#[async_trait]
pub trait SocketFactory: Send + Sync + fmt::Debug {
    /// Creates a socket to `url`, negotiating `protocol` when given.
    ///
    /// Connection failures are reported through the event stream, not the
    /// return value.
    ///
    /// # Errors
    ///
    /// Returns an error if the request itself cannot be built.
    async fn create(&self, url: &Url, protocol: Option<&str>) -> Result<SocketConnection>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_ready_state() {
        let state = AtomicReadyState::default();
        assert_eq!(state.load(), ReadyState::Connecting);

        state.store(ReadyState::Closing);
        assert_eq!(state.load(), ReadyState::Closing);
        assert!(state.load().is_closing_or_closed());
        assert!(!ReadyState::Open.is_closing_or_closed());
    }
}
