//! Persistent socket engine.
//!
//! Requests are multiplexed over one socket. Each call is tagged with an id
//! of the form `<method>/<seq>` and its response is routed back through the
//! emitter under [`EventKey::Rpc`]. Frames without an id are live query
//! notifications.
//!
//! # Socket Events
//!
//! | Event | Handling |
//! |-------|----------|
//! | `Open` | Enter `Open`; a failing observer raises fatal error 3001 |
//! | `Message` | Route by id; an unroutable frame raises error 3002 |
//! | `Error` | Raise fatal error 3000 |
//! | `Close` | Reset the session, report unusual codes, enter `Closed` |
//!
//! Events of a socket that has since been replaced or abandoned are
//! dropped.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::{CorrelationId, SerialId};
use crate::protocol::{Payload, RpcOutcome, RpcRequest, RpcResponse, ValidationContext, method};
use crate::task::AbortSignal;
use crate::transport::socket::CLOSE_NORMAL;
use crate::transport::{SocketEvent, SocketFactory, SocketHandle};

use super::core::merge_query_vars;
use super::{
    ConnectionInfo, ConnectionState, Disconnected, Engine, EngineConfig, EngineCore, EngineError,
    EngineEvent, EventKey,
};

// ============================================================================
// WebSocketEngineOptions
// ============================================================================

/// Tuning for [`WebSocketEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketEngineOptions {
    /// How long `connect` waits for the socket to open.
    pub open_timeout: Duration,
}

impl WebSocketEngineOptions {
    /// Default open timeout.
    pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

    /// Sets the open timeout.
    #[inline]
    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

impl Default for WebSocketEngineOptions {
    fn default() -> Self {
        Self {
            open_timeout: Self::DEFAULT_OPEN_TIMEOUT,
        }
    }
}

// ============================================================================
// WebSocketEngine
// ============================================================================

/// Engine for `ws://` and `wss://` endpoints.
#[derive(Debug, Clone)]
pub struct WebSocketEngine {
    inner: Arc<WsInner>,
}

#[derive(Debug)]
struct WsInner {
    core: EngineCore,
    factory: Arc<dyn SocketFactory>,
    options: WebSocketEngineOptions,
    serial: SerialId,
    /// Bumped for every socket; events of older sockets are dropped.
    generation: AtomicU64,
    socket: Mutex<Option<Arc<dyn SocketHandle>>>,
    /// Running `Open` handler, awaited before `Close` is handled.
    open_task: Mutex<Option<JoinHandle<()>>>,
    /// Held while the socket is torn down, so a peer close and a local
    /// disconnect never interleave their transitions.
    teardown: tokio::sync::Mutex<()>,
}

impl WebSocketEngine {
    /// Engine name.
    pub const NAME: &'static str = "websocket";

    /// Creates a closed engine that opens sockets through `factory`.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn SocketFactory>,
        options: WebSocketEngineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(WsInner {
                core: EngineCore::new(Self::NAME, config),
                factory,
                options,
                serial: SerialId::new(),
                generation: AtomicU64::new(0),
                socket: Mutex::new(None),
                open_task: Mutex::new(None),
                teardown: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Returns the options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &WebSocketEngineOptions {
        &self.inner.options
    }
}

impl Drop for WsInner {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.get_mut().take() {
            socket.close(CLOSE_NORMAL, "");
        }
    }
}

// ============================================================================
// Socket Event Handling
// ============================================================================

/// Close codes reported as engine errors.
fn is_error_close(code: u16) -> bool {
    matches!(code, 1002 | 1003 | 1007..=1015)
}

/// Forwards socket events to the engine until the socket closes.
async fn pump(
    weak: Weak<WsInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    handle: Arc<dyn SocketHandle>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            handle.close(CLOSE_NORMAL, "");
            break;
        };
        let closed = matches!(event, SocketEvent::Close { .. });

        if !inner.is_current(generation) {
            trace!(generation, "Dropping event of a stale socket");
        } else {
            match event {
                SocketEvent::Open => {
                    let task = tokio::spawn(Arc::clone(&inner).handle_open(Arc::clone(&handle)));
                    *inner.open_task.lock() = Some(task);
                }
                SocketEvent::Message(payload) => inner.handle_message(&payload),
                SocketEvent::Error(message) => inner.handle_error(message),
                SocketEvent::Close { code, reason } => {
                    inner.handle_close(generation, code, &reason).await;
                }
            }
        }

        if closed {
            break;
        }
    }
}

impl WsInner {
    #[inline]
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    async fn handle_open(self: Arc<Self>, handle: Arc<dyn SocketHandle>) {
        *self.socket.lock() = Some(handle);

        let fallback = || {
            *self.socket.lock() = None;
            self.core.reset_conn();
            ConnectionState::Closed
        };
        if let Err(e) = self.core.set_state(ConnectionState::Open, fallback).await {
            let error = EngineError::fatal(
                EngineError::OPEN_HANDLER,
                "An error occurred within the handler for the open event",
            )
            .with_cause(e);
            self.core.emitter().emit(EngineEvent::Error(error));
        }
    }

    fn handle_message(&self, payload: &Payload) {
        match self.route(payload) {
            Ok(event) => {
                self.core.emitter().emit(event);
            }
            Err(e) => {
                debug!(error = %e, bytes = payload.len(), "Dropping unroutable frame");
                let error = EngineError::non_fatal(
                    EngineError::MESSAGE_HANDLER,
                    "An error occurred within the handler for the message event",
                )
                .with_cause(e);
                self.core.emitter().emit(EngineEvent::Error(error));
            }
        }
    }

    /// Turns a frame into the event it answers.
    fn route(&self, payload: &Payload) -> Result<EngineEvent> {
        let endpoint = self.core.endpoint();
        let ctx = ValidationContext::new(WebSocketEngine::NAME, endpoint.as_ref());

        let value = self.core.formatter().decode(payload)?;
        let response = self.core.validator().parse_rpc_response(value, &ctx)?;

        if let Some(id) = response.id.clone() {
            return Ok(EngineEvent::Rpc(id, response));
        }

        match response.outcome {
            RpcOutcome::Result(result) => Ok(EngineEvent::Live(
                self.core.validator().parse_live_result(result, &ctx)?,
            )),
            RpcOutcome::Error(error) => Err(Error::rpc_response(RpcResponse {
                id: None,
                outcome: RpcOutcome::Error(error),
            })),
        }
    }

    fn handle_error(&self, message: String) {
        warn!(%message, "Socket error");
        let error = EngineError::fatal(EngineError::SOCKET_ERROR, message);
        self.core.emitter().emit(EngineEvent::Error(error));
    }

    async fn handle_close(&self, generation: u64, code: u16, reason: &str) {
        let _teardown = self.teardown.lock().await;
        if !self.is_current(generation) {
            trace!(generation, "Socket was released while closing");
            return;
        }

        self.await_open_task().await;
        self.reset_session();
        debug!(code, reason, "Socket closed");

        if is_error_close(code) {
            let error = EngineError::non_fatal(code, reason);
            self.core.emitter().emit(EngineEvent::Error(error));
        }

        if let Err(e) = self
            .core
            .set_state(ConnectionState::Closed, || ConnectionState::Closed)
            .await
        {
            debug!(error = %e, "Closed listeners failed");
        }
    }

    /// Gives up on the current socket after a failed connect.
    async fn abandon(&self, handle: Option<&Arc<dyn SocketHandle>>) {
        let _teardown = self.teardown.lock().await;
        self.release(handle).await;
    }

    /// Detaches the current socket and enters `Closed` unless a close
    /// already did. The caller holds `teardown`.
    async fn release(&self, handle: Option<&Arc<dyn SocketHandle>>) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(handle) = handle {
            handle.close(CLOSE_NORMAL, "");
        }

        self.await_open_task().await;
        self.reset_session();

        if self.core.state() == ConnectionState::Closed {
            return;
        }
        if let Err(e) = self
            .core
            .set_state(ConnectionState::Closed, || ConnectionState::Closed)
            .await
        {
            debug!(error = %e, "Closed listeners failed");
        }
    }

    async fn await_open_task(&self) {
        let open_task = self.open_task.lock().take();
        if let Some(task) = open_task {
            let _ = task.await;
        }
    }

    fn reset_session(&self) {
        self.serial.reset();
        *self.socket.lock() = None;
        self.core.reset_conn();
    }
}

// ============================================================================
// Engine Implementation
// ============================================================================

#[async_trait]
impl Engine for WebSocketEngine {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn state(&self) -> ConnectionState {
        self.inner.core.state()
    }

    fn connection(&self) -> ConnectionInfo {
        self.inner.core.conn()
    }

    async fn connect(&self, endpoint: Url, signal: &AbortSignal) -> Result<()> {
        let inner = &self.inner;

        inner
            .core
            .exclusive(async {
                if inner.core.state() == ConnectionState::Open {
                    return Ok(());
                }
                signal.check()?;

                inner.core.begin_conn(endpoint.clone());
                inner
                    .core
                    .set_state(ConnectionState::Connecting, || {
                        inner.core.reset_conn();
                        ConnectionState::Closed
                    })
                    .await?;

                let race = signal.child();
                let emitter = inner.core.emitter();
                let opened = emitter.once(EventKey::State(ConnectionState::Open), Some(&race));
                let closed = emitter.once(EventKey::State(ConnectionState::Closed), Some(&race));
                let errored = emitter.once(EventKey::Error, Some(&race));

                let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
                let protocol = inner.core.formatter().protocol();
                let connection = match inner.factory.create(&endpoint, protocol).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        inner.abandon(None).await;
                        return Err(e);
                    }
                };
                let handle = Arc::clone(&connection.handle);
                tokio::spawn(pump(
                    Arc::downgrade(inner),
                    generation,
                    connection.events,
                    Arc::clone(&handle),
                ));
                debug!(%endpoint, generation, "Socket created");

                let timeout = inner.options.open_timeout;
                let outcome = tokio::select! {
                    biased;
                    result = opened => result.map(drop),
                    result = closed => result.and_then(|_| {
                        Err(Error::connection("Socket closed before it opened"))
                    }),
                    result = errored => result.and_then(|event| {
                        let message = match event {
                            EngineEvent::Error(e) => e.message,
                            _ => "Socket failed before it opened".to_string(),
                        };
                        Err(Error::connection(message))
                    }),
                    () = tokio::time::sleep(timeout) => {
                        Err(Error::connection_timeout(timeout.as_millis() as u64))
                    }
                };

                match outcome {
                    Ok(()) => {
                        info!(%endpoint, "WebSocket engine open");
                        Ok(())
                    }
                    Err(e) => {
                        inner.abandon(Some(&handle)).await;
                        Err(e)
                    }
                }
            })
            .await
    }

    async fn disconnect(&self, signal: &AbortSignal) -> Result<Disconnected> {
        let inner = &self.inner;

        inner
            .core
            .exclusive(async {
                let teardown = inner.teardown.lock().await;
                if inner.core.state() == ConnectionState::Closed {
                    return Ok(Disconnected::AlreadyDisconnected);
                }

                let closed = inner
                    .core
                    .emitter()
                    .once(EventKey::State(ConnectionState::Closed), Some(signal));

                let closing = inner
                    .core
                    .set_state(ConnectionState::Closing, || ConnectionState::Closing)
                    .await;

                let socket = inner.socket.lock().clone();
                match socket {
                    Some(handle) => {
                        if !handle.ready_state().is_closing_or_closed() {
                            handle.close(CLOSE_NORMAL, "");
                        }
                        // The close handler needs the guard to announce `Closed`.
                        drop(teardown);
                        closed.await?;
                    }
                    None => {
                        drop(closed);
                        inner.release(None).await;
                    }
                }

                closing.map(|()| Disconnected::Disconnected)
            })
            .await
    }

    async fn rpc(&self, request: RpcRequest, signal: &AbortSignal) -> Result<RpcResponse> {
        let inner = &self.inner;
        signal.check()?;
        inner.core.wait_open(signal).await?;

        let socket = inner
            .socket
            .lock()
            .clone()
            .ok_or_else(Error::connection_unavailable)?;
        let conn = inner.core.conn();
        let ctx = ValidationContext::new(Self::NAME, conn.endpoint.as_ref());

        let mut request = inner.core.validator().parse_rpc_request(request, &ctx)?;

        if request.method == method::USE {
            let namespace = request.param_str(0).filter(|ns| !ns.is_empty());
            let database = request.param_str(1).filter(|db| !db.is_empty());
            if database.is_some() && namespace.is_none() && conn.namespace.is_none() {
                return Err(Error::MissingNamespace);
            }
        }
        if request.method == method::QUERY {
            request = merge_query_vars(request, None);
        }

        let id = CorrelationId::new(&request.method, inner.serial.next());
        let payload = inner.core.formatter().encode(&request.to_value(Some(&id)))?;

        // Register before sending so a fast reply or close is not missed.
        let emitter = inner.core.emitter();
        let reply = emitter.once(EventKey::Rpc(id.clone()), Some(signal));
        let closed = emitter.once(EventKey::State(ConnectionState::Closed), Some(signal));
        socket.send(payload)?;
        trace!(%id, "Request sent");

        let event = tokio::select! {
            biased;
            event = reply => event?,
            result = closed => {
                result?;
                debug!(%id, "Socket closed with the call in flight");
                return Err(Error::connection_unavailable_because("Connection closed"));
            }
        };
        let EngineEvent::Rpc(id, response) = event else {
            return Err(Error::connection_unavailable());
        };

        match response.outcome {
            RpcOutcome::Result(result) => {
                let ctx = ctx.with_request(&request);
                let result = inner.core.validator().parse_rpc_result(result, &ctx)?;
                inner.core.apply_session(&request, &result);
                Ok(RpcResponse {
                    id: Some(id),
                    outcome: RpcOutcome::Result(result),
                })
            }
            RpcOutcome::Error(error) => Ok(RpcResponse {
                id: Some(id),
                outcome: RpcOutcome::Error(error),
            }),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
