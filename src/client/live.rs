//! Live query subscriptions.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::engine::{ConnectionState, EngineEvent, EventKey};
use crate::error::Result;
use crate::identifiers::LiveId;
use crate::protocol::LiveNotification;
use crate::task::{Listener, TaskEmitter};

// ============================================================================
// LiveSubscription
// ============================================================================

/// Notifications of one live query, in arrival order.
///
/// The stream ends once the connection enters `Closed`. Dropping the
/// subscription stops delivery.
pub struct LiveSubscription {
    id: LiveId,
    notifications: mpsc::UnboundedReceiver<LiveNotification>,
    emitter: TaskEmitter<EngineEvent>,
    listener: Listener<EngineEvent>,
    /// Drops the sender when the connection closes, ending the stream.
    on_closed: Listener<EngineEvent>,
}

impl fmt::Debug for LiveSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl LiveSubscription {
    /// Starts forwarding `Live(id)` events of `emitter`.
    pub(crate) fn register(emitter: TaskEmitter<EngineEvent>, id: LiveId) -> Result<Self> {
        let (tx, notifications) = mpsc::unbounded_channel();
        let sender = Arc::new(Mutex::new(Some(tx)));

        // Forwarded when the listener is invoked, not in its task, so order holds.
        let listener = {
            let sender = Arc::clone(&sender);
            Listener::new(move |_, event| {
                if let EngineEvent::Live(notification) = event
                    && let Some(tx) = sender.lock().as_ref()
                {
                    let _ = tx.send(notification);
                }
                async { Ok(()) }
            })
        };
        let on_closed = Listener::new(move |_, _| {
            sender.lock().take();
            async { Ok(()) }
        });

        let closed = EventKey::State(ConnectionState::Closed);
        emitter.on(closed.clone(), &on_closed)?;
        if let Err(e) = emitter.on(EventKey::Live(id), &listener) {
            emitter.off(&closed, Some(&on_closed));
            return Err(e);
        }

        Ok(Self {
            id,
            notifications,
            emitter,
            listener,
            on_closed,
        })
    }

    /// Returns the live query id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> LiveId {
        self.id
    }

    /// Waits for the next notification.
    ///
    /// Returns `None` once the connection has closed and every earlier
    /// notification was taken.
    pub async fn next(&mut self) -> Option<LiveNotification> {
        self.notifications.recv().await
    }
}

impl Stream for LiveSubscription {
    type Item = LiveNotification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.notifications.poll_recv(cx)
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.emitter
            .off(&EventKey::Live(self.id), Some(&self.listener));
        self.emitter.off(
            &EventKey::State(ConnectionState::Closed),
            Some(&self.on_closed),
        );
    }
}
