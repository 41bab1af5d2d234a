//! Cancellation signal with an abort reason.
//!
//! [`AbortSignal`] pairs a [`CancellationToken`] with the [`Error`] that
//! caused the abort, so every waiter that observes the cancellation fails
//! with the same reason.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{Error, Result};

// ============================================================================
// AbortSignal
// ============================================================================

/// Cloneable cancellation signal carrying an abort reason.
///
/// Clones share state: aborting one clone aborts them all. The first reason
/// wins.
///
/// # Example
///
/// ```ignore
/// let signal = AbortSignal::timeout(Duration::from_secs(5));
/// client.rpc("ping", vec![], RpcOptions::with_signal(signal)).await?;
/// ```
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    token: CancellationToken,
    reason: OnceLock<Error>,
    parent: Option<AbortSignal>,
    /// Stops the timeout task once the last clone is dropped.
    timer: Option<DropGuard>,
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .field("reason", &self.reason())
            .finish()
    }
}

// ============================================================================
// AbortSignal - Constructors
// ============================================================================

impl AbortSignal {
    /// Creates a signal that is not aborted.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signal that aborts with [`Error::Timeout`] after `duration`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        let stop = CancellationToken::new();
        let signal = Self {
            inner: Arc::new(SignalInner {
                timer: Some(stop.clone().drop_guard()),
                ..SignalInner::default()
            }),
        };
        let weak = Arc::downgrade(&signal.inner);
        let token = signal.inner.token.clone();
        let timeout_ms = duration.as_millis() as u64;

        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(duration) => {
                    if let Some(inner) = weak.upgrade() {
                        AbortSignal { inner }.abort(Error::timeout("signal", timeout_ms));
                    }
                }
                () = token.cancelled() => {}
                () = stop.cancelled() => {}
            }
        });

        signal
    }

    /// Creates a signal that is already aborted with `reason`.
    #[must_use]
    pub fn aborted_with(reason: Error) -> Self {
        let signal = Self::new();
        signal.abort(reason);
        signal
    }

    /// Creates a linked child signal.
    ///
    /// The child aborts when this signal aborts (inheriting its reason) and
    /// can also be aborted on its own without affecting the parent.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                token: self.inner.token.child_token(),
                reason: OnceLock::new(),
                parent: Some(self.clone()),
                timer: None,
            }),
        }
    }
}

// ============================================================================
// AbortSignal - Operations
// ============================================================================

impl AbortSignal {
    /// Aborts the signal with `reason`.
    ///
    /// Has no effect if the signal is already aborted.
    pub fn abort(&self, reason: Error) {
        if self.inner.token.is_cancelled() {
            return;
        }
        let _ = self.inner.reason.set(reason);
        self.inner.token.cancel();
    }

    /// Returns `true` once the signal is aborted.
    #[inline]
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Returns the abort reason, or `None` while not aborted.
    #[must_use]
    pub fn reason(&self) -> Option<Error> {
        if !self.is_aborted() {
            return None;
        }

        self.inner
            .reason
            .get()
            .cloned()
            .or_else(|| self.inner.parent.as_ref().and_then(Self::reason))
            .or_else(|| Some(Error::aborted("signal aborted")))
    }

    /// Fails with the abort reason if the signal is aborted.
    ///
    /// # Errors
    ///
    /// Returns the abort reason.
    #[inline]
    pub fn check(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Waits until the signal is aborted and returns the reason.
    pub async fn aborted(&self) -> Error {
        self.inner.token.cancelled().await;
        self.reason()
            .unwrap_or_else(|| Error::aborted("signal aborted"))
    }

    /// Returns the underlying cancellation token.
    #[inline]
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }
}

// ============================================================================
// Tests
// ============================================================================
