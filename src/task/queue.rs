//! Tracked set of in-flight asynchronous work.
//!
//! Every unit added to a [`TaskQueue`] is spawned on the tokio runtime and
//! receives the queue's [`AbortSignal`]. The queue keeps track of each unit
//! until it settles; the most recent failures stay tracked so
//! [`TaskQueue::dispose`] can report them. Older failures beyond the
//! queue's failure limit are logged and dropped.
//!
//! # Lifecycle
//!
//! 1. `add` - Spawn work, get a [`TaskHandle`] for its outcome
//! 2. `abort` - Signal cancellation to all outstanding work (no waiting)
//! 3. `dispose` - Wait for everything, collect failures, refuse new work

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, Shared, join_all, ready};
use futures_util::FutureExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::error::{AggregateTasksError, Error, Result, TaskFailure};
use crate::identifiers::TaskId;

use super::AbortSignal;

// ============================================================================
// Types
// ============================================================================

/// Shared, cloneable outcome of one task.
type SharedOutcome = Shared<BoxFuture<'static, Result<()>>>;

// ============================================================================
// Constants
// ============================================================================

/// Failures a queue retains for [`TaskQueue::dispose`] by default.
pub const DEFAULT_FAILURE_LIMIT: usize = 1024;

// ============================================================================
// TaskHandle
// ============================================================================

/// Eventual outcome of a task added to a [`TaskQueue`].
///
/// Awaiting the handle yields the task's result. Dropping it does not cancel
/// the task.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    outcome: SharedOutcome,
}

impl TaskHandle {
    /// Creates a handle that is already settled with `outcome`.
    #[must_use]
    pub fn settled(outcome: Result<()>) -> Self {
        Self {
            id: TaskId::next(),
            outcome: ready(outcome).boxed().shared(),
        }
    }

    /// Returns the task id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome).poll(cx)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("settled", &self.outcome.peek().is_some())
            .finish()
    }
}

// ============================================================================
// TaskQueue
// ============================================================================

/// Tracks in-flight asynchronous work with abort and disposal.
///
/// # Thread Safety
///
/// `TaskQueue` is `Send + Sync`; clones share the same queue.
#[derive(Clone, Default)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    tasks: Mutex<Tracked>,
    /// Signal handed to every task.
    signal: AbortSignal,
    /// Set once `dispose` has drained the queue.
    disposed: AtomicBool,
    /// Most failures retained at once.
    failure_limit: usize,
}

#[derive(Default)]
struct Tracked {
    /// Unsettled tasks and retained failures, keyed by task id.
    outcomes: FxHashMap<TaskId, SharedOutcome>,
    /// Retained failures, oldest first.
    failed: VecDeque<TaskId>,
    /// Failures dropped past the limit since the last dispose.
    discarded: usize,
}

impl Default for QueueInner {
    fn default() -> Self {
        Self {
            tasks: Mutex::default(),
            signal: AbortSignal::new(),
            disposed: AtomicBool::new(false),
            failure_limit: DEFAULT_FAILURE_LIMIT,
        }
    }
}

impl QueueInner {
    /// Untracks a success, or retains a failure within the limit.
    fn settle(&self, id: TaskId, succeeded: bool) {
        let mut tasks = self.tasks.lock();
        if succeeded {
            tasks.outcomes.remove(&id);
            return;
        }
        // Already drained by dispose.
        if !tasks.outcomes.contains_key(&id) {
            return;
        }

        tasks.failed.push_back(id);
        while tasks.failed.len() > self.failure_limit {
            let Some(oldest) = tasks.failed.pop_front() else {
                break;
            };
            tasks.outcomes.remove(&oldest);
            tasks.discarded += 1;
            warn!(task = %oldest, limit = self.failure_limit, "Dropping old task failure");
        }
    }
}

impl TaskQueue {
    /// Creates an empty queue.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty queue retaining at most `limit` failures.
    ///
    /// A limit of zero is raised to one.
    #[must_use]
    pub fn with_failure_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                failure_limit: limit.max(1),
                ..QueueInner::default()
            }),
        }
    }

    /// Adds a unit of work.
    ///
    /// `runner` receives the queue's abort signal and returns the future to
    /// run. The future is spawned immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceAlreadyDisposed`] after [`dispose`](Self::dispose).
    pub fn add<F, Fut>(&self, runner: F) -> Result<TaskHandle>
    where
        F: FnOnce(AbortSignal) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.is_disposed() {
            return Err(Error::disposed("TaskQueue"));
        }

        let id = TaskId::next();
        let future = runner(self.inner.signal.clone());
        let weak = Arc::downgrade(&self.inner);

        let mut tasks = self.inner.tasks.lock();
        if self.is_disposed() {
            return Err(Error::disposed("TaskQueue"));
        }

        let join = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(Error::TaskPanicked {
                    message: panic_message(panic.as_ref()),
                }),
            };

            if let Some(inner) = weak.upgrade() {
                inner.settle(id, outcome.is_ok());
            }

            outcome
        });

        let outcome = async move {
            join.await.unwrap_or_else(|e| {
                Err(Error::TaskPanicked {
                    message: e.to_string(),
                })
            })
        }
        .boxed()
        .shared();

        tasks.outcomes.insert(id, outcome.clone());
        trace!(%id, tracked = tasks.outcomes.len(), "Task added");

        Ok(TaskHandle { id, outcome })
    }

    /// Signals cancellation to all outstanding work without waiting.
    pub fn abort(&self, reason: Error) {
        debug!(reason = %reason, "Aborting task queue");
        self.inner.signal.abort(reason);
    }

    /// Waits for all tracked work to settle and refuses new work afterwards.
    ///
    /// Work added while disposal is in progress is awaited as well. Failures
    /// are returned, never raised. Only failures within the queue's failure
    /// limit are reported.
    ///
    /// # Errors
    ///
    /// Returns an [`AggregateTasksError`] tagging every failed task.
    pub async fn dispose(&self) -> std::result::Result<(), AggregateTasksError> {
        let mut failures = Vec::new();
        let mut discarded = 0;

        loop {
            let batch: Vec<(TaskId, SharedOutcome)> = {
                let mut tasks = self.inner.tasks.lock();
                discarded += std::mem::take(&mut tasks.discarded);
                if tasks.outcomes.is_empty() {
                    self.inner.disposed.store(true, Ordering::Release);
                    break;
                }
                tasks.failed.clear();
                tasks.outcomes.drain().collect()
            };

            let outcomes =
                join_all(batch.into_iter().map(|(id, task)| async move { (id, task.await) }))
                    .await;

            for (task, outcome) in outcomes {
                if let Err(error) = outcome {
                    failures.push(TaskFailure { task, error });
                }
            }
        }

        failures.sort_by_key(|f| f.task);
        debug!(failed = failures.len(), discarded, "Task queue disposed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateTasksError::new(failures))
        }
    }

    /// Returns `true` once disposal has completed.
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Returns the number of tracked tasks (running or retained failures).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.tasks.lock().outcomes.len()
    }

    /// Returns `true` if no task is tracked.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the signal handed to every task.
    #[inline]
    #[must_use]
    pub fn signal(&self) -> &AbortSignal {
        &self.inner.signal
    }
}

/// Extracts a readable message from a panic payload.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::time::sleep;

    #[tokio::test]
    async fn test_handle_resolves_with_outcome() {
        let queue = TaskQueue::new();

        let ok = queue.add(|_| async { Ok(()) }).expect("add");
        let failed = queue
            .add(|_| async { Err(Error::aborted("nope")) })
            .expect("add");

        assert!(ok.await.is_ok());
        assert!(matches!(failed.await, Err(Error::Aborted { .. })));
    }

    #[tokio::test]
    async fn test_successful_tasks_are_untracked() {
        let queue = TaskQueue::new();
        let handle = queue.add(|_| async { Ok(()) }).expect("add");
        handle.await.expect("task");

        // Untracking happens inside the spawned task right before it settles.
        sleep(Duration::from_millis(10)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dispose_aggregates_only_failures() {
        let queue = TaskQueue::new();
        let mut ids = Vec::new();

        for i in 0..4 {
            let handle = queue
                .add(move |_| async move {
                    sleep(Duration::from_millis(5)).await;
                    if i % 2 == 0 {
                        Err(Error::aborted(format!("task {i}")))
                    } else {
                        Ok(())
                    }
                })
                .expect("add");
            ids.push(handle.id());
        }

        let err = queue.dispose().await.expect_err("two tasks failed");
        assert_eq!(err.len(), 2);
        assert_eq!(err.failures[0].task, ids[0]);
        assert_eq!(err.failures[1].task, ids[2]);
        assert!(queue.is_disposed());
    }

    #[tokio::test]
    async fn test_failures_beyond_limit_are_dropped_oldest_first() {
        let queue = TaskQueue::with_failure_limit(2);
        let mut ids = Vec::new();

        for i in 0..4 {
            let handle = queue
                .add(move |_| async move { Err(Error::aborted(format!("task {i}"))) })
                .expect("add");
            ids.push(handle.id());
            assert!(handle.await.is_err());
        }
        assert_eq!(queue.len(), 2);

        let err = queue.dispose().await.expect_err("retained failures");
        assert_eq!(err.len(), 2);
        assert_eq!(err.failures[0].task, ids[2]);
        assert_eq!(err.failures[1].task, ids[3]);
    }

    #[tokio::test]
    async fn test_dispose_waits_for_running_work() {
        let queue = TaskQueue::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = Arc::clone(&done);
            queue
                .add(move |_| async move {
                    sleep(Duration::from_millis(20)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .expect("add");
        }

        queue.dispose().await.expect("all succeed");
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_work_added_while_disposing_is_awaited() {
        let queue = TaskQueue::new();
        let nested = queue.clone();

        queue
            .add(move |_| async move {
                sleep(Duration::from_millis(10)).await;
                nested
                    .add(|_| async {
                        sleep(Duration::from_millis(10)).await;
                        Err(Error::aborted("late"))
                    })
                    .map(|_| ())
            })
            .expect("add");

        let err = queue.dispose().await.expect_err("late task failed");
        assert_eq!(err.len(), 1);
        assert!(matches!(err.failures[0].error, Error::Aborted { .. }));
    }

    #[tokio::test]
    async fn test_add_after_dispose_fails() {
        let queue = TaskQueue::new();
        queue.dispose().await.expect("empty queue");

        let result = queue.add(|_| async { Ok(()) });
        assert!(matches!(
            result,
            Err(Error::ResourceAlreadyDisposed { resource: "TaskQueue" })
        ));
    }

    #[tokio::test]
    async fn test_abort_reaches_running_tasks() {
        let queue = TaskQueue::new();

        let handle = queue
            .add(|signal| async move { Err(signal.aborted().await) })
            .expect("add");

        queue.abort(Error::EngineDisconnected);

        assert!(matches!(handle.await, Err(Error::EngineDisconnected)));
        let err = queue.dispose().await.expect_err("aborted task failed");
        assert!(matches!(err.failures[0].error, Error::EngineDisconnected));
    }

    #[tokio::test]
    async fn test_panics_are_captured() {
        let queue = TaskQueue::new();
        let handle = queue
            .add(|_| async {
                if true {
                    panic!("listener exploded");
                }
                Ok(())
            })
            .expect("add");

        match handle.await {
            Err(Error::TaskPanicked { message }) => assert_eq!(message, "listener exploded"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_settled_handle() {
        assert!(TaskHandle::settled(Ok(())).await.is_ok());
        assert!(TaskHandle::settled(Err(Error::MissingNamespace)).await.is_err());
    }
}
