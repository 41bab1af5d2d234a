//! Event-keyed scheduling of listener tasks.
//!
//! A [`TaskEmitter`] maps event keys to listeners. Emitting an event never
//! calls listeners inline: each listener invocation becomes a task on the
//! emitter's [`TaskQueue`], so a slow or failing listener cannot block the
//! emitter and [`TaskEmitter::dispose`] can drain every scheduled reaction.
//!
//! # Events
//!
//! Events are a tagged union implementing [`Event`]; the payload decides the
//! key it is delivered under.
//!
//! ```ignore
//! let emitter = TaskEmitter::<EngineEvent>::new();
//! let waiter = emitter.once(EventKey::State(ConnectionState::Open), None);
//! emitter.emit(EngineEvent::State(ConnectionState::Open));
//! waiter.await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::{Future, pending};
use std::hash::Hash;
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, ready};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{AggregateTasksError, Error, Result};
use crate::identifiers::ListenerId;

use super::{AbortSignal, TaskHandle, TaskQueue};

// ============================================================================
// Event
// ============================================================================

/// An event that can be emitted through a [`TaskEmitter`].
pub trait Event: Clone + Send + Sync + 'static {
    /// Key listeners register under.
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Returns the key this event is delivered under.
    fn key(&self) -> Self::Key;
}

// ============================================================================
// Listener
// ============================================================================

/// Boxed listener callback.
type ListenerFn<E> = dyn Fn(AbortSignal, E) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// A listener callback with a stable identity.
///
/// Clones share the identity, so registering a clone of an already
/// registered listener is a no-op.
pub struct Listener<E> {
    id: ListenerId,
    callback: Arc<ListenerFn<E>>,
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<E> fmt::Debug for Listener<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).finish()
    }
}

impl<E: Event> Listener<E> {
    /// Wraps a callback.
    ///
    /// The callback receives the queue's abort signal and the event.
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(AbortSignal, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: ListenerId::next(),
            callback: Arc::new(move |signal, event| callback(signal, event).boxed()),
        }
    }

    /// Returns the listener identity.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

// ============================================================================
// Entries
// ============================================================================

/// One registration under an event key.
enum Entry<E> {
    Listener(Listener<E>),
    Waiter {
        id: ListenerId,
        tx: oneshot::Sender<E>,
    },
}

impl<E> Entry<E> {
    fn id(&self) -> ListenerId {
        match self {
            Self::Listener(listener) => listener.id,
            Self::Waiter { id, .. } => *id,
        }
    }
}

/// Work extracted from the registry during one emission.
enum Dispatch<E> {
    Listener(Arc<ListenerFn<E>>),
    Waiter(oneshot::Sender<E>),
}

type Registry<E> = FxHashMap<<E as Event>::Key, Vec<Entry<E>>>;

// ============================================================================
// TaskEmitter
// ============================================================================

/// Event multiplexer whose listeners run as queued tasks.
///
/// Cloning is cheap; clones share listeners and the task queue.
pub struct TaskEmitter<E: Event> {
    inner: Arc<EmitterInner<E>>,
}

struct EmitterInner<E: Event> {
    listeners: Mutex<Registry<E>>,
    queue: TaskQueue,
}

impl<E: Event> Clone for TaskEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Event> Default for TaskEmitter<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                listeners: Mutex::new(FxHashMap::default()),
                queue: TaskQueue::new(),
            }),
        }
    }
}

impl<E: Event> fmt::Debug for TaskEmitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEmitter")
            .field("keys", &self.inner.listeners.lock().len())
            .field("tasks", &self.inner.queue.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ============================================================================
// TaskEmitter - Registration
// ============================================================================

impl<E: Event> TaskEmitter<E> {
    /// Creates an emitter with no listeners.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for `key`.
    ///
    /// Registering the same listener twice for the same key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceAlreadyDisposed`] after disposal.
    pub fn on(&self, key: E::Key, listener: &Listener<E>) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::disposed("TaskEmitter"));
        }

        let mut listeners = self.inner.listeners.lock();
        let entries = listeners.entry(key).or_default();

        if !entries.iter().any(|entry| entry.id() == listener.id) {
            entries.push(Entry::Listener(listener.clone()));
        }

        Ok(())
    }

    /// Removes `listener` from `key`, or every registration if `None`.
    pub fn off(&self, key: &E::Key, listener: Option<&Listener<E>>) {
        let mut listeners = self.inner.listeners.lock();

        match listener {
            Some(listener) => remove_entry(&mut listeners, key, listener.id),
            None => {
                listeners.remove(key);
            }
        }
    }

    /// Waits for the next emission under `key`.
    ///
    /// Registration happens when this method is called, not when the
    /// returned future is first polled. The future resolves at most once:
    ///
    /// - with the emitted event;
    /// - with the signal's reason if `signal` aborts first (the waiter is
    ///   deregistered);
    /// - with [`Error::ResourceAlreadyDisposed`] if the emitter is disposed.
    ///
    /// An already-aborted signal fails immediately without registering.
    /// Dropping the future deregisters the waiter.
    pub fn once(&self, key: E::Key, signal: Option<&AbortSignal>) -> BoxFuture<'static, Result<E>> {
        if self.is_disposed() {
            return ready(Err(Error::disposed("TaskEmitter"))).boxed();
        }

        if let Some(signal) = signal
            && let Err(reason) = signal.check()
        {
            return ready(Err(reason)).boxed();
        }

        let (tx, rx) = oneshot::channel();
        let id = ListenerId::next();

        self.inner
            .listeners
            .lock()
            .entry(key.clone())
            .or_default()
            .push(Entry::Waiter { id, tx });

        trace!(?key, %id, "Waiter registered");

        let guard = WaiterGuard {
            emitter: Arc::downgrade(&self.inner),
            key,
            id,
        };
        let signal = signal.cloned();

        async move {
            let _guard = guard;
            let aborted = async {
                match &signal {
                    Some(signal) => signal.aborted().await,
                    None => pending().await,
                }
            };

            tokio::select! {
                biased;
                received = rx => received.map_err(|_| Error::disposed("TaskEmitter")),
                reason = aborted => Err(reason),
            }
        }
        .boxed()
    }

    /// Returns the number of registrations (listeners and waiters) for `key`.
    #[must_use]
    pub fn listener_count(&self, key: &E::Key) -> usize {
        self.inner
            .listeners
            .lock()
            .get(key)
            .map_or(0, Vec::len)
    }
}

// ============================================================================
// TaskEmitter - Emission
// ============================================================================

impl<E: Event> TaskEmitter<E> {
    /// Emits `event` to every registration under its key.
    ///
    /// Each listener is scheduled as a queued task in registration order;
    /// waiters are resolved and removed. Returns the task handles, or `None`
    /// if nothing was registered. Never blocks.
    pub fn emit(&self, event: E) -> Option<Vec<TaskHandle>> {
        let key = event.key();

        let dispatch: Vec<Dispatch<E>> = {
            let mut listeners = self.inner.listeners.lock();
            let entries = listeners.get_mut(&key)?;
            let mut dispatch = Vec::with_capacity(entries.len());

            for entry in std::mem::take(entries) {
                match entry {
                    Entry::Listener(listener) => {
                        dispatch.push(Dispatch::Listener(Arc::clone(&listener.callback)));
                        entries.push(Entry::Listener(listener));
                    }
                    Entry::Waiter { tx, .. } => dispatch.push(Dispatch::Waiter(tx)),
                }
            }

            if entries.is_empty() {
                listeners.remove(&key);
            }

            dispatch
        };

        trace!(?key, fan_out = dispatch.len(), "Event emitted");

        let handles = dispatch
            .into_iter()
            .map(|item| match item {
                Dispatch::Listener(callback) => {
                    let event = event.clone();
                    self.inner
                        .queue
                        .add(move |signal| callback(signal, event))
                        .unwrap_or_else(|e| TaskHandle::settled(Err(e)))
                }
                Dispatch::Waiter(tx) => {
                    let _ = tx.send(event.clone());
                    TaskHandle::settled(Ok(()))
                }
            })
            .collect();

        Some(handles)
    }
}

// ============================================================================
// TaskEmitter - Lifecycle
// ============================================================================

impl<E: Event> TaskEmitter<E> {
    /// Returns `true` once the emitter is disposed.
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.queue.is_disposed()
    }

    /// Waits for every triggered listener task and disposes the emitter.
    ///
    /// Pending waiters fail with [`Error::ResourceAlreadyDisposed`].
    ///
    /// # Errors
    ///
    /// Returns the aggregate of all failed listener tasks.
    pub async fn dispose(&self) -> std::result::Result<(), AggregateTasksError> {
        let result = self.inner.queue.dispose().await;
        self.inner.listeners.lock().clear();
        result
    }

    /// Signals cancellation to every running listener task.
    pub fn abort(&self, reason: Error) {
        self.inner.queue.abort(reason);
    }
}

// ============================================================================
// WaiterGuard
// ============================================================================

/// Deregisters a one-shot waiter when its future settles or is dropped.
struct WaiterGuard<E: Event> {
    emitter: Weak<EmitterInner<E>>,
    key: E::Key,
    id: ListenerId,
}

impl<E: Event> Drop for WaiterGuard<E> {
    fn drop(&mut self) {
        if let Some(inner) = self.emitter.upgrade() {
            remove_entry(&mut inner.listeners.lock(), &self.key, self.id);
        }
    }
}

fn remove_entry<E: Event>(listeners: &mut Registry<E>, key: &E::Key, id: ListenerId) {
    if let Some(entries) = listeners.get_mut(key) {
        entries.retain(|entry| entry.id() != id);
        if entries.is_empty() {
            listeners.remove(key);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
