//! Client defaults and per-call options.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use dbrpc::{ClientOptions, DisconnectOptions, RpcOptions};
//!
//! let options = ClientOptions::new().with_rpc_timeout(Duration::from_secs(10));
//!
//! let forced = DisconnectOptions::new().with_force();
//! let cancellable = RpcOptions::new().with_signal(my_signal);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::task::AbortSignal;

// ============================================================================
// ClientOptions
// ============================================================================

/// Default timeouts applied when a call carries no signal of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Timeout of [`Client::connect`](super::Client::connect).
    pub connect_timeout: Duration,

    /// Timeout of [`Client::disconnect`](super::Client::disconnect).
    pub disconnect_timeout: Duration,

    /// Timeout of [`Client::rpc`](super::Client::rpc).
    pub rpc_timeout: Duration,
}

impl ClientOptions {
    /// Default connect timeout.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

    /// Default disconnect timeout.
    pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(15);

    /// Default RPC timeout.
    pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates options with the default timeouts.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            disconnect_timeout: Self::DEFAULT_DISCONNECT_TIMEOUT,
            rpc_timeout: Self::DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Sets the connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the disconnect timeout.
    #[inline]
    #[must_use]
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Sets the RPC timeout.
    #[inline]
    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Per-Call Options
// ============================================================================

/// Options for [`Client::connect`](super::Client::connect).
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Cancels the connect. Defaults to the connect timeout.
    pub signal: Option<AbortSignal>,
}

impl ConnectOptions {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cancellation signal.
    #[inline]
    #[must_use]
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Options for [`Client::disconnect`](super::Client::disconnect).
#[derive(Debug, Clone, Default)]
pub struct DisconnectOptions {
    /// Abort every in-flight listener before disconnecting.
    pub force: bool,

    /// Cancels the disconnect. Defaults to the disconnect timeout.
    pub signal: Option<AbortSignal>,
}

impl DisconnectOptions {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts in-flight work with [`Error::EngineDisconnected`](crate::Error::EngineDisconnected).
    #[inline]
    #[must_use]
    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Sets the cancellation signal.
    #[inline]
    #[must_use]
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Options for [`Client::rpc`](super::Client::rpc).
#[derive(Debug, Clone, Default)]
pub struct RpcOptions {
    /// Cancels the call. Defaults to the RPC timeout.
    pub signal: Option<AbortSignal>,
}

impl RpcOptions {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cancellation signal.
    #[inline]
    #[must_use]
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Returns `signal`, or a fresh signal that times out after `timeout`.
pub(crate) fn signal_or_timeout(signal: Option<AbortSignal>, timeout: Duration) -> AbortSignal {
    signal.unwrap_or_else(|| AbortSignal::timeout(timeout))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::Error;

    #[test]
    fn test_default_timeouts() {
        let options = ClientOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(15));
        assert_eq!(options.disconnect_timeout, Duration::from_secs(15));
        assert_eq!(options.rpc_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_builder_methods_chain() {
        let options = ClientOptions::new()
            .with_connect_timeout(Duration::from_secs(1))
            .with_disconnect_timeout(Duration::from_secs(2))
            .with_rpc_timeout(Duration::from_millis(300));

        assert_eq!(options.connect_timeout, Duration::from_secs(1));
        assert_eq!(options.disconnect_timeout, Duration::from_secs(2));
        assert_eq!(options.rpc_timeout, Duration::from_millis(300));
    }

    #[test]
    fn test_disconnect_options() {
        let options = DisconnectOptions::new();
        assert!(!options.force);
        assert!(options.signal.is_none());
        assert!(DisconnectOptions::new().with_force().force);
    }

    #[tokio::test]
    async fn test_explicit_signal_wins() {
        let signal = AbortSignal::aborted_with(Error::aborted("caller"));
        let resolved = signal_or_timeout(Some(signal), Duration::from_secs(60));
        assert!(resolved.is_aborted());
    }

    #[tokio::test]
    async fn test_default_signal_times_out() {
        let signal = signal_or_timeout(None, Duration::from_millis(10));
        let reason = signal.aborted().await;
        assert!(reason.is_timeout());
    }
}
