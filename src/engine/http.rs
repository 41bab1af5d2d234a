//! Stateless request/response engine.
//!
//! Each RPC call is one POST. The engine emulates the session a socket
//! connection would hold on the server:
//!
//! | Method | Handling |
//! |--------|----------|
//! | `use` | Stored locally, sent as `Surreal-NS` / `Surreal-DB` headers |
//! | `let` / `unset` | Local variable cache, never sent |
//! | `query` | Cache merged into the query variables |
//! | `signin` / `signup` / `authenticate` | Token stored, sent as `Authorization` |
//! | `invalidate` | Token dropped |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::{Payload, RpcOutcome, RpcRequest, RpcResponse, ValidationContext, method};
use crate::task::AbortSignal;
use crate::transport::{FetchRequest, Fetcher};

use super::core::merge_query_vars;
use super::{ConnectionInfo, ConnectionState, Disconnected, Engine, EngineConfig, EngineCore};

// ============================================================================
// HttpEngine
// ============================================================================

/// Engine for `http://` and `https://` endpoints.
#[derive(Debug)]
pub struct HttpEngine {
    core: EngineCore,
    fetcher: Arc<dyn Fetcher>,
    /// Session variables defined through `let`.
    vars: Mutex<Map<String, Value>>,
}

impl HttpEngine {
    /// Engine name.
    pub const NAME: &'static str = "http";

    /// Creates a closed engine that sends requests through `fetcher`.
    #[must_use]
    pub fn new(config: EngineConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            core: EngineCore::new(Self::NAME, config),
            fetcher,
            vars: Mutex::new(Map::new()),
        }
    }

    /// Returns a snapshot of the session variable cache.
    #[must_use]
    pub fn vars(&self) -> Map<String, Value> {
        self.vars.lock().clone()
    }

    /// Handles the methods that never reach the server.
    fn handle_locally(&self, request: &RpcRequest) -> Result<Option<Value>> {
        match request.method.as_str() {
            method::USE => {
                self.core
                    .update_conn(|conn| conn.select(request.param_str(0), request.param_str(1)))?;
                Ok(Some(Value::Null))
            }
            method::LET => {
                let name = request.param_str(0).unwrap_or_default().to_string();
                let value = self.core.formatter().copy(request.param(1))?;
                trace!(%name, "Session variable set");
                self.vars.lock().insert(name, value);
                Ok(Some(Value::Null))
            }
            method::UNSET => {
                if let Some(name) = request.param_str(0) {
                    self.vars.lock().remove(name);
                }
                Ok(Some(Value::Null))
            }
            _ => Ok(None),
        }
    }

    /// Builds the request headers from the connection record.
    fn headers(&self, conn: &ConnectionInfo) -> Vec<(String, String)> {
        let content_type = self.core.formatter().content_type().to_string();
        let mut headers = vec![
            ("Content-Type".to_string(), content_type.clone()),
            ("Accept".to_string(), content_type),
        ];

        if let Some(ns) = &conn.namespace {
            headers.push(("Surreal-NS".to_string(), ns.clone()));
        }
        if let Some(db) = &conn.database {
            headers.push(("Surreal-DB".to_string(), db.clone()));
        }
        if let Some(token) = &conn.token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }

        headers
    }
}

// ============================================================================
// Engine Implementation
// ============================================================================

#[async_trait]
impl Engine for HttpEngine {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    fn connection(&self) -> ConnectionInfo {
        self.core.conn()
    }

    async fn connect(&self, endpoint: Url, signal: &AbortSignal) -> Result<()> {
        self.core
            .exclusive(async {
                if self.core.state() == ConnectionState::Open {
                    return Ok(());
                }
                signal.check()?;

                self.vars.lock().clear();
                self.core.begin_conn(endpoint);

                let fallback = || {
                    self.core.reset_conn();
                    ConnectionState::Closed
                };
                self.core
                    .set_state(ConnectionState::Connecting, fallback)
                    .await?;
                self.core.set_state(ConnectionState::Open, fallback).await?;

                debug!(engine = Self::NAME, "Engine open");
                Ok(())
            })
            .await
    }

    async fn disconnect(&self, _signal: &AbortSignal) -> Result<Disconnected> {
        self.core
            .exclusive(async {
                if self.core.state() == ConnectionState::Closed {
                    return Ok(Disconnected::AlreadyDisconnected);
                }

                let closing = self
                    .core
                    .set_state(ConnectionState::Closing, || ConnectionState::Closing)
                    .await;

                self.core.reset_conn();
                self.vars.lock().clear();

                // Failures of `Closed` observers are for the client to handle.
                if let Err(e) = self
                    .core
                    .set_state(ConnectionState::Closed, || ConnectionState::Closed)
                    .await
                {
                    debug!(error = %e, "Closed listeners failed");
                }

                closing.map(|()| Disconnected::Disconnected)
            })
            .await
    }

    async fn rpc(&self, request: RpcRequest, signal: &AbortSignal) -> Result<RpcResponse> {
        signal.check()?;
        self.core.wait_open(signal).await?;

        let endpoint = self
            .core
            .endpoint()
            .ok_or_else(Error::connection_unavailable)?;
        let ctx = ValidationContext::new(Self::NAME, Some(&endpoint));

        let mut request = self.core.validator().parse_rpc_request(request, &ctx)?;

        if let Some(result) = self.handle_locally(&request)? {
            return Ok(RpcResponse::ok(result));
        }
        if request.method == method::QUERY {
            let session = self.vars.lock().clone();
            request = merge_query_vars(request, Some(&session));
        }

        let conn = self.core.conn();
        if conn.namespace.is_none() && conn.database.is_some() {
            return Err(Error::MissingNamespace);
        }

        let body = self.core.formatter().encode(&request.to_value(None))?;
        let response = self
            .fetcher
            .fetch(
                &endpoint,
                FetchRequest {
                    headers: self.headers(&conn),
                    body,
                    signal: signal.clone(),
                },
            )
            .await?;

        let invalid = |message: String, body: &[u8]| Error::InvalidResponse {
            message,
            method: request.method.clone(),
            endpoint: endpoint.to_string(),
            status: Some(response.status),
            body: String::from_utf8_lossy(body).into_owned(),
        };

        if !response.is_success() {
            let text = String::from_utf8_lossy(&response.body);
            let message = if text.trim().is_empty() {
                format!("HTTP status {}", response.status)
            } else {
                text.into_owned()
            };
            return Err(invalid(message, &response.body));
        }

        let decoded = self
            .core
            .formatter()
            .decode(&Payload::Binary(response.body.clone()))
            .map_err(|e| invalid(e.to_string(), &response.body))?;

        let ctx = ctx.with_request(&request);
        let RpcResponse { outcome, .. } = self.core.validator().parse_rpc_response(decoded, &ctx)?;

        match outcome {
            RpcOutcome::Result(result) => {
                let result = self.core.validator().parse_rpc_result(result, &ctx)?;
                self.core.apply_session(&request, &result);
                Ok(RpcResponse::ok(result))
            }
            RpcOutcome::Error(error) => Ok(RpcResponse {
                id: None,
                outcome: RpcOutcome::Error(error),
            }),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::engine::EventKey;
    use crate::task::{Listener, TaskEmitter};
    use crate::testing::{MockFetcher, engine_config};

    fn endpoint() -> Url {
        Url::parse("http://localhost:8000/rpc").expect("url")
    }

    async fn open_engine(fetcher: &Arc<MockFetcher>) -> HttpEngine {
        let engine = HttpEngine::new(engine_config(TaskEmitter::new()), fetcher.clone());
        engine
            .connect(endpoint(), &AbortSignal::new())
            .await
            .expect("connect");
        engine
    }

    fn rpc(method: &str, params: Value) -> RpcRequest {
        RpcRequest::new(method, params.as_array().cloned().unwrap_or_default())
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_cycle() {
        let fetcher = Arc::new(MockFetcher::new());
        let engine = open_engine(&fetcher).await;
        assert_eq!(engine.state(), ConnectionState::Open);
        assert_eq!(engine.connection().endpoint, Some(endpoint()));

        let signal = AbortSignal::new();
        assert_eq!(
            engine.disconnect(&signal).await.expect("disconnect"),
            Disconnected::Disconnected
        );
        assert_eq!(
            engine.disconnect(&signal).await.expect("disconnect"),
            Disconnected::AlreadyDisconnected
        );
        assert_eq!(engine.state(), ConnectionState::Closed);
        assert_eq!(engine.connection(), ConnectionInfo::default());
        assert_eq!(fetcher.request_count(), 0);
    }

    #[tokio::test]
    async fn test_let_is_local_and_merged_into_query() {
        let fetcher = Arc::new(MockFetcher::new());
        let engine = open_engine(&fetcher).await;
        let signal = AbortSignal::new();

        let response = engine
            .rpc(rpc("let", json!(["x", 1])), &signal)
            .await
            .expect("let");
        assert_eq!(response.result(), Some(&Value::Null));
        assert_eq!(fetcher.request_count(), 0);

        fetcher.respond_json(200, json!({ "result": [{ "result": 1 }] }));
        engine
            .rpc(rpc("query", json!(["RETURN $x"])), &signal)
            .await
            .expect("query");

        let sent = fetcher.last_body().expect("request sent");
        assert_eq!(sent["method"], "query");
        assert_eq!(sent["params"], json!(["RETURN $x", { "x": 1 }]));
        assert!(sent.get("id").is_none());
    }

    #[tokio::test]
    async fn test_unset_removes_variable() {
        let fetcher = Arc::new(MockFetcher::new());
        let engine = open_engine(&fetcher).await;
        let signal = AbortSignal::new();

        engine.rpc(rpc("let", json!(["x", 1])), &signal).await.expect("let");
        engine.rpc(rpc("unset", json!(["x"])), &signal).await.expect("unset");

        assert!(engine.vars().is_empty());
        assert_eq!(fetcher.request_count(), 0);
    }

    #[tokio::test]
    async fn test_use_database_without_namespace_fails() {
        let fetcher = Arc::new(MockFetcher::new());
        let engine = open_engine(&fetcher).await;

        let err = engine
            .rpc(rpc("use", json!([null, "mydb"])), &AbortSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MissingNamespace));
        assert_eq!(engine.connection().database, None);
    }

    #[tokio::test]
    async fn test_session_headers() {
        let fetcher = Arc::new(MockFetcher::new());
        let engine = open_engine(&fetcher).await;
        let signal = AbortSignal::new();

        engine
            .rpc(rpc("use", json!(["app", "main"])), &signal)
            .await
            .expect("use");

        fetcher.respond_json(200, json!({ "result": "jwt-token" }));
        engine
            .rpc(rpc("signin", json!([{ "user": "root", "pass": "root" }])), &signal)
            .await
            .expect("signin");
        assert_eq!(engine.connection().token.as_deref(), Some("jwt-token"));

        fetcher.respond_json(200, json!({ "result": [] }));
        engine
            .rpc(rpc("query", json!(["SELECT * FROM t"])), &signal)
            .await
            .expect("query");

        let request = fetcher.last_request().expect("request");
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("accept"), Some("application/json"));
        assert_eq!(request.header("surreal-ns"), Some("app"));
        assert_eq!(request.header("surreal-db"), Some("main"));
        assert_eq!(request.header("authorization"), Some("Bearer jwt-token"));

        fetcher.respond_json(200, json!({ "result": null }));
        engine
            .rpc(rpc("invalidate", json!([])), &signal)
            .await
            .expect("invalidate");
        assert_eq!(engine.connection().token, None);
    }

    #[tokio::test]
    async fn test_authenticate_stores_request_token() {
        let fetcher = Arc::new(MockFetcher::new());
        let engine = open_engine(&fetcher).await;

        fetcher.respond_json(200, json!({ "result": null }));
        engine
            .rpc(rpc("authenticate", json!(["given"])), &AbortSignal::new())
            .await
            .expect("authenticate");

        assert_eq!(engine.connection().token.as_deref(), Some("given"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_invalid_response() {
        let fetcher = Arc::new(MockFetcher::new());
        let engine = open_engine(&fetcher).await;

        fetcher.respond(500, b"There was a problem".to_vec());
        let err = engine
            .rpc(rpc("ping", json!([])), &AbortSignal::new())
            .await
            .unwrap_err();

        match err {
            Error::InvalidResponse {
                message,
                method,
                status,
                body,
                endpoint,
            } => {
                assert_eq!(message, "There was a problem");
                assert_eq!(method, "ping");
                assert_eq!(status, Some(500));
                assert_eq!(body, "There was a problem");
                assert_eq!(endpoint, "http://localhost:8000/rpc");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_response() {
        let fetcher = Arc::new(MockFetcher::new());
        let engine = open_engine(&fetcher).await;

        fetcher.respond(200, b"<html>".to_vec());
        let err = engine
            .rpc(rpc("ping", json!([])), &AbortSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResponse { status: Some(200), .. }));
    }

    #[tokio::test]
    async fn test_rpc_error_is_returned_as_response() {
        let fetcher = Arc::new(MockFetcher::new());
        let engine = open_engine(&fetcher).await;

        fetcher.respond_json(200, json!({ "error": { "code": -32000, "message": "nope" } }));
        let response = engine
            .rpc(rpc("ping", json!([])), &AbortSignal::new())
            .await
            .expect("transport ok");

        assert_eq!(response.error_code(), Some(-32000));
        assert_eq!(response.id, None);
    }

    #[tokio::test]
    async fn test_rpc_without_connection_is_unavailable() {
        let fetcher = Arc::new(MockFetcher::new());
        let engine = HttpEngine::new(engine_config(TaskEmitter::new()), fetcher);

        let err = engine
            .rpc(rpc("ping", json!([])), &AbortSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_failing_open_listener_rolls_back_to_closed() {
        let fetcher = Arc::new(MockFetcher::new());
        let emitter = TaskEmitter::new();
        let listener = Listener::new(|_, _| async { Err(Error::aborted("refuse open")) });
        emitter
            .on(EventKey::State(ConnectionState::Open), &listener)
            .expect("on");

        let engine = HttpEngine::new(engine_config(emitter), fetcher);
        let err = engine
            .connect(endpoint(), &AbortSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AggregateTasks(_)));
        assert_eq!(engine.state(), ConnectionState::Closed);
        assert_eq!(engine.connection().endpoint, None);
    }

    fn record_states(emitter: &TaskEmitter<crate::engine::EngineEvent>) -> Arc<Mutex<Vec<ConnectionState>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for state in [
            ConnectionState::Closed,
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
        ] {
            let sink = Arc::clone(&log);
            let listener = Listener::new(move |_, _| {
                sink.lock().push(state);
                async { Ok(()) }
            });
            emitter.on(EventKey::State(state), &listener).expect("on");
        }
        log
    }

    fn is_transition(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::{Closed, Closing, Connecting, Open};
        matches!(
            (from, to),
            (Closed, Connecting) | (Connecting, Open) | (Connecting, Closed) | (Open, Closing) | (Closing, Closed)
        )
    }

    proptest::proptest! {
        #[test]
        fn prop_state_sequence_follows_machine(ops in proptest::collection::vec(proptest::bool::ANY, 1..16)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");

            let observed = runtime.block_on(async {
                let emitter = TaskEmitter::new();
                let log = record_states(&emitter);
                let engine = HttpEngine::new(engine_config(emitter), Arc::new(MockFetcher::new()));
                let signal = AbortSignal::new();

                for connect in ops {
                    if connect {
                        engine.connect(endpoint(), &signal).await.expect("connect");
                    } else {
                        engine.disconnect(&signal).await.expect("disconnect");
                    }
                }
                let observed = log.lock().clone();
                observed
            });

            let mut previous = ConnectionState::Closed;
            for state in observed {
                proptest::prop_assert!(is_transition(previous, state), "{previous} -> {state}");
                previous = state;
            }
        }
    }
}
