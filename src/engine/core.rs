//! Connection state machine shared by all engines.
//!
//! [`EngineCore`] owns an engine's state, its connection record and its
//! emitter. State only changes through [`EngineCore::set_state`], which
//! announces the new state and waits for every observer before returning.
//! Lifecycle operations run through [`EngineCore::exclusive`].
//!
//! # State Machine
//!
//! ```text
//! Closed ──► Connecting ──► Open ──► Closing ──► Closed
//!    ▲            │           │
//!    └────────────┴───────────┘  (failure short-circuits)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::error::{AggregateTasksError, Error, Result, TaskFailure};
use crate::protocol::{Formatter, RpcRequest, Validator, method};
use crate::task::{AbortSignal, TaskEmitter};

use super::{EngineConfig, EngineEvent, EventKey};

// ============================================================================
// ConnectionState
// ============================================================================

/// Engine connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Closed,
    /// Connection being established.
    Connecting,
    /// Ready for RPC calls.
    Open,
    /// Connection being torn down.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        })
    }
}

// ============================================================================
// ConnectionInfo
// ============================================================================

/// Transient record of the active connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Endpoint URL.
    pub endpoint: Option<Url>,
    /// Selected namespace.
    pub namespace: Option<String>,
    /// Selected database.
    pub database: Option<String>,
    /// Authentication token.
    pub token: Option<String>,
}

impl ConnectionInfo {
    /// Applies a `use` selection.
    ///
    /// Empty or missing values leave the current selection untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingNamespace`] if a database is selected while no
    /// namespace is set or supplied. Nothing is changed in that case.
    pub fn select(&mut self, namespace: Option<&str>, database: Option<&str>) -> Result<()> {
        let namespace = namespace.filter(|ns| !ns.is_empty());
        let database = database.filter(|db| !db.is_empty());

        if database.is_some() && namespace.is_none() && self.namespace.is_none() {
            return Err(Error::MissingNamespace);
        }
        if let Some(ns) = namespace {
            self.namespace = Some(ns.to_string());
        }
        if let Some(db) = database {
            self.database = Some(db.to_string());
        }
        Ok(())
    }
}

// ============================================================================
// EngineCore
// ============================================================================

/// State, connection record and emitter of one engine instance.
pub struct EngineCore {
    name: &'static str,
    state: RwLock<ConnectionState>,
    conn: Mutex<ConnectionInfo>,
    emitter: TaskEmitter<EngineEvent>,
    formatter: Arc<dyn Formatter>,
    validator: Arc<dyn Validator>,
    /// FIFO guard serializing `connect` and `disconnect`.
    lifecycle: tokio::sync::Mutex<()>,
}

impl fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCore")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("endpoint", &self.conn.lock().endpoint)
            .finish_non_exhaustive()
    }
}

impl EngineCore {
    /// Creates a closed core.
    #[must_use]
    pub fn new(name: &'static str, config: EngineConfig) -> Self {
        Self {
            name,
            state: RwLock::new(ConnectionState::Closed),
            conn: Mutex::new(ConnectionInfo::default()),
            emitter: config.emitter,
            formatter: config.formatter,
            validator: config.validator,
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the engine name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Returns the shared emitter.
    #[inline]
    #[must_use]
    pub fn emitter(&self) -> &TaskEmitter<EngineEvent> {
        &self.emitter
    }

    /// Returns the formatter.
    #[inline]
    #[must_use]
    pub fn formatter(&self) -> &dyn Formatter {
        self.formatter.as_ref()
    }

    /// Returns the validator.
    #[inline]
    #[must_use]
    pub fn validator(&self) -> &dyn Validator {
        self.validator.as_ref()
    }
}

// ============================================================================
// EngineCore - State Machine
// ============================================================================

impl EngineCore {
    /// Moves to `target` and waits for every observer of the transition.
    ///
    /// If any `State(target)` listener fails, the state is demoted to
    /// `on_failure()` and the failures are returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AggregateTasks`] with every failed listener.
    pub async fn set_state(
        &self,
        target: ConnectionState,
        on_failure: impl FnOnce() -> ConnectionState,
    ) -> Result<()> {
        *self.state.write() = target;
        debug!(engine = self.name, state = %target, "State changed");

        let Some(handles) = self.emitter.emit(EngineEvent::State(target)) else {
            return Ok(());
        };

        let outcomes = join_all(
            handles
                .into_iter()
                .map(|handle| async move { (handle.id(), handle.await) }),
        )
        .await;

        let failures: Vec<TaskFailure> = outcomes
            .into_iter()
            .filter_map(|(task, outcome)| outcome.err().map(|error| TaskFailure { task, error }))
            .collect();

        if failures.is_empty() {
            return Ok(());
        }

        let fallback = on_failure();
        *self.state.write() = fallback;
        warn!(
            engine = self.name,
            state = %target,
            fallback = %fallback,
            failed = failures.len(),
            "State listeners failed, rolled back"
        );

        Err(Error::AggregateTasks(AggregateTasksError::new(failures)))
    }

    /// Runs a lifecycle operation once all earlier ones have finished.
    pub async fn exclusive<F: Future>(&self, operation: F) -> F::Output {
        let _guard = self.lifecycle.lock().await;
        operation.await
    }

    /// Waits for `Open` while a connect is in progress.
    ///
    /// Returns immediately in any other state.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionUnavailable`] if the connection closes instead
    /// - The signal's reason if `signal` aborts first
    pub async fn wait_open(&self, signal: &AbortSignal) -> Result<()> {
        if self.state() != ConnectionState::Connecting {
            return Ok(());
        }

        // Register before re-checking so a transition in between is not missed.
        let opened = self
            .emitter
            .once(EventKey::State(ConnectionState::Open), Some(signal));
        let closed = self
            .emitter
            .once(EventKey::State(ConnectionState::Closed), Some(signal));

        if self.state() != ConnectionState::Connecting {
            return Ok(());
        }

        tokio::select! {
            result = opened => result.map(drop),
            result = closed => {
                result?;
                Err(Error::connection_unavailable_because("Connection closed"))
            }
        }
    }
}

// ============================================================================
// EngineCore - Connection Record
// ============================================================================

impl EngineCore {
    /// Returns a snapshot of the connection record.
    #[inline]
    #[must_use]
    pub fn conn(&self) -> ConnectionInfo {
        self.conn.lock().clone()
    }

    /// Returns the endpoint of the connection record.
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> Option<Url> {
        self.conn.lock().endpoint.clone()
    }

    /// Mutates the connection record under its lock.
    pub fn update_conn<T>(&self, update: impl FnOnce(&mut ConnectionInfo) -> T) -> T {
        update(&mut self.conn.lock())
    }

    /// Clears the connection record.
    pub fn reset_conn(&self) {
        *self.conn.lock() = ConnectionInfo::default();
    }

    /// Clears the record and stores `endpoint` for a new attempt.
    pub fn begin_conn(&self, endpoint: Url) {
        *self.conn.lock() = ConnectionInfo {
            endpoint: Some(endpoint),
            ..ConnectionInfo::default()
        };
    }

    /// Mirrors the session effects of a successful call.
    ///
    /// `use` stores namespace and database, `signin`/`signup` store the
    /// returned token, `authenticate` stores the supplied token and
    /// `invalidate` drops it.
    pub fn apply_session(&self, request: &RpcRequest, result: &Value) {
        let mut conn = self.conn.lock();

        match request.method.as_str() {
            method::USE => {
                let _ = conn.select(request.param_str(0), request.param_str(1));
            }
            method::SIGNIN | method::SIGNUP => {
                conn.token = result.as_str().map(str::to_string);
            }
            method::AUTHENTICATE => {
                conn.token = request.param_str(0).map(str::to_string);
            }
            method::INVALIDATE => conn.token = None,
            _ => {}
        }
    }
}

// ============================================================================
// Query Normalization
// ============================================================================

/// Rewrites a `query` request as `[text, vars]`.
///
/// Variables are merged in order: `session` (lowest precedence), the vars
/// bundled with the query, then the per-call vars.
pub(crate) fn merge_query_vars(request: RpcRequest, session: Option<&Map<String, Value>>) -> RpcRequest {
    let mut params = request.params.into_iter();
    let query = params.next().unwrap_or(Value::Null);
    let call_vars = params.next();

    let mut vars = session.cloned().unwrap_or_default();
    let text = match query {
        Value::Object(mut object) => {
            if let Some(Value::Object(base)) = object.remove("vars") {
                vars.extend(base);
            }
            object.remove("text").unwrap_or(Value::Null)
        }
        text => text,
    };
    if let Some(Value::Object(call_vars)) = call_vars {
        vars.extend(call_vars);
    }

    RpcRequest::new(request.method, vec![text, Value::Object(vars)])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::protocol::{BasicValidator, JsonFormatter};
    use crate::task::Listener;

    fn core() -> EngineCore {
        EngineCore::new(
            "test",
            EngineConfig {
                emitter: TaskEmitter::new(),
                formatter: Arc::new(JsonFormatter),
                validator: Arc::new(BasicValidator),
            },
        )
    }

    #[tokio::test]
    async fn test_set_state_waits_for_fan_out() {
        let core = core();
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);

        let listener = Listener::new(move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        core.emitter()
            .on(EventKey::State(ConnectionState::Open), &listener)
            .expect("on");

        core.set_state(ConnectionState::Open, || ConnectionState::Closed)
            .await
            .expect("transition");

        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(core.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_set_state_rolls_back_on_listener_failure() {
        let core = core();
        let listener = Listener::new(|_, _| async { Err(Error::aborted("observer broke")) });
        core.emitter()
            .on(EventKey::State(ConnectionState::Connecting), &listener)
            .expect("on");

        let err = core
            .set_state(ConnectionState::Connecting, || ConnectionState::Closed)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AggregateTasks(ref agg) if agg.len() == 1));
        assert_eq!(core.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_listener_observes_new_state() {
        let core = Arc::new(core());
        let observed = Arc::new(parking_lot::Mutex::new(None));

        let probe = Arc::clone(&core);
        let sink = Arc::clone(&observed);
        let listener = Listener::new(move |_, _| {
            let probe = Arc::clone(&probe);
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock() = Some(probe.state());
                Ok(())
            }
        });
        core.emitter()
            .on(EventKey::State(ConnectionState::Closing), &listener)
            .expect("on");

        core.set_state(ConnectionState::Closing, || ConnectionState::Closing)
            .await
            .expect("transition");

        assert_eq!(*observed.lock(), Some(ConnectionState::Closing));
    }

    #[tokio::test]
    async fn test_exclusive_serializes_in_order() {
        let core = Arc::new(core());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..3u64 {
            let core = Arc::clone(&core);
            let log = Arc::clone(&log);
            tasks.push(tokio::spawn(async move {
                core.exclusive(async {
                    log.lock().push(("start", i));
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    log.lock().push(("end", i));
                })
                .await;
            }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for task in tasks {
            task.await.expect("join");
        }

        let log = log.lock();
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, "start");
            assert_eq!(pair[1].0, "end");
            assert_eq!(pair[0].1, pair[1].1);
        }
        assert_eq!(log.iter().filter(|(k, _)| *k == "start").map(|(_, i)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_wait_open_resolves_on_open() {
        let core = Arc::new(core());
        core.set_state(ConnectionState::Connecting, || ConnectionState::Closed)
            .await
            .expect("connecting");

        let waiter = {
            let core = Arc::clone(&core);
            tokio::spawn(async move { core.wait_open(&AbortSignal::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        core.set_state(ConnectionState::Open, || ConnectionState::Closed)
            .await
            .expect("open");
        waiter.await.expect("join").expect("opened");
    }

    #[tokio::test]
    async fn test_wait_open_fails_when_closed_first() {
        let core = Arc::new(core());
        core.set_state(ConnectionState::Connecting, || ConnectionState::Closed)
            .await
            .expect("connecting");

        let waiter = {
            let core = Arc::clone(&core);
            tokio::spawn(async move { core.wait_open(&AbortSignal::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        core.set_state(ConnectionState::Closed, || ConnectionState::Closed)
            .await
            .expect("closed");
        let err = waiter.await.expect("join").unwrap_err();
        assert!(matches!(err, Error::ConnectionUnavailable { .. }));
    }

    #[test]
    fn test_select_requires_namespace_for_database() {
        let mut conn = ConnectionInfo::default();
        assert!(matches!(conn.select(None, Some("db")), Err(Error::MissingNamespace)));
        assert_eq!(conn.database, None);

        conn.select(Some("ns"), Some("db")).expect("both");
        assert_eq!(conn.namespace.as_deref(), Some("ns"));

        conn.select(None, Some("other")).expect("namespace already set");
        assert_eq!(conn.database.as_deref(), Some("other"));
    }

    #[test]
    fn test_apply_session_tracks_token() {
        let core = core();
        core.apply_session(&RpcRequest::new("signin", vec![json!({})]), &json!("jwt"));
        assert_eq!(core.conn().token.as_deref(), Some("jwt"));

        core.apply_session(&RpcRequest::new("authenticate", vec![json!("other")]), &Value::Null);
        assert_eq!(core.conn().token.as_deref(), Some("other"));

        core.apply_session(&RpcRequest::new("invalidate", vec![]), &Value::Null);
        assert_eq!(core.conn().token, None);
    }

    #[test]
    fn test_merge_query_vars_precedence() {
        let mut session = Map::new();
        session.insert("a".into(), json!("session"));
        session.insert("b".into(), json!("session"));

        let request = RpcRequest::new(
            "query",
            vec![
                json!({ "text": "RETURN $a", "vars": { "b": "bundled", "c": "bundled" } }),
                json!({ "c": "call" }),
            ],
        );
        let merged = merge_query_vars(request, Some(&session));

        assert_eq!(merged.params[0], json!("RETURN $a"));
        assert_eq!(merged.params[1], json!({ "a": "session", "b": "bundled", "c": "call" }));
    }
}
