//! Client orchestration.
//!
//! A [`Client`] owns at most one engine at a time, chosen by the endpoint's
//! URL scheme, and the emitter that engine reports through. `connect` and
//! `disconnect` are serialized; `rpc` calls run concurrently.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::engine::{
    ConnectionInfo, ConnectionState, Disconnected, Engine, EngineConfig, EngineEvent, EventKey,
};
use crate::error::{Error, Result};
use crate::identifiers::LiveId;
use crate::protocol::{Formatter, RpcRequest, Validator, method};
use crate::task::{Listener, TaskEmitter};

use super::builder::ClientBuilder;
use super::live::LiveSubscription;
use super::options::{
    ClientOptions, ConnectOptions, DisconnectOptions, RpcOptions, signal_or_timeout,
};
use super::registry::EngineRegistry;

/// Path every endpoint is normalized to end with.
const RPC_ROUTE: &str = "rpc";

// ============================================================================
// Client
// ============================================================================

/// Database RPC client.
///
/// Cheap to clone; clones share the connection.
///
/// # Example
///
/// ```no_run
/// use dbrpc::{Client, ConnectOptions, DisconnectOptions};
///
/// # async fn example() -> dbrpc::Result<()> {
/// let client = Client::builder().build()?;
/// client.connect("ws://localhost:8000", ConnectOptions::default()).await?;
///
/// client.use_ns_db(Some("app"), Some("main")).await?;
/// let rows = client.query("SELECT * FROM person", None).await?;
///
/// client.disconnect(DisconnectOptions::default()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Collaborators assembled by [`ClientBuilder`].
pub(crate) struct ClientParts {
    pub registry: EngineRegistry,
    pub formatter: Arc<dyn Formatter>,
    pub validator: Arc<dyn Validator>,
    pub options: ClientOptions,
}

struct ClientInner {
    registry: EngineRegistry,
    formatter: Arc<dyn Formatter>,
    validator: Arc<dyn Validator>,
    options: ClientOptions,
    /// FIFO guard serializing `connect` and `disconnect`.
    lifecycle: tokio::sync::Mutex<()>,
    /// Emitter of the current connection, replaced on every disconnect.
    emitter: RwLock<TaskEmitter<EngineEvent>>,
    engine: RwLock<Option<Arc<dyn Engine>>>,
    /// Registered on every emitter; reacts to engine error events.
    error_listener: Listener<EngineEvent>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("endpoint", &self.endpoint())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Client - Construction
// ============================================================================

impl Client {
    /// Creates a builder for a new client.
    #[inline]
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn new(parts: ClientParts) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| ClientInner {
            registry: parts.registry,
            formatter: parts.formatter,
            validator: parts.validator,
            options: parts.options,
            lifecycle: tokio::sync::Mutex::new(()),
            emitter: RwLock::new(TaskEmitter::new()),
            engine: RwLock::new(None),
            error_listener: error_listener(weak.clone()),
        });

        Self { inner }
    }
}

/// Logs engine errors and force-disconnects on fatal ones.
fn error_listener(client: Weak<ClientInner>) -> Listener<EngineEvent> {
    Listener::new(move |_, event| {
        let client = client.clone();
        async move {
            let EngineEvent::Error(engine_error) = event else {
                return Ok(());
            };

            if !engine_error.fatal {
                warn!(error = %engine_error, "Engine error");
                return Ok(());
            }

            error!(error = %engine_error, "Fatal engine error, disconnecting");
            if let Some(inner) = client.upgrade() {
                let client = Client { inner };
                tokio::spawn(async move {
                    let options = DisconnectOptions::new().with_force();
                    if let Err(e) = client.disconnect(options).await {
                        error!(error = %e, "Forced disconnect failed");
                    }
                });
            }
            Ok(())
        }
    })
}

// ============================================================================
// Client - Accessors
// ============================================================================

impl Client {
    /// Returns the default timeouts.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Returns the state of the current engine, `Closed` if there is none.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.engine()
            .map_or(ConnectionState::Closed, |engine| engine.state())
    }

    /// Returns the endpoint of the current connection.
    #[must_use]
    pub fn endpoint(&self) -> Option<Url> {
        self.engine()
            .and_then(|engine| engine.connection().endpoint)
    }

    /// Returns a snapshot of the current connection record.
    #[must_use]
    pub fn connection(&self) -> ConnectionInfo {
        self.engine()
            .map(|engine| engine.connection())
            .unwrap_or_default()
    }

    /// Returns the current engine.
    #[inline]
    #[must_use]
    pub fn engine(&self) -> Option<Arc<dyn Engine>> {
        self.inner.engine.read().clone()
    }

    /// Returns the emitter of the current connection.
    #[inline]
    #[must_use]
    pub fn emitter(&self) -> TaskEmitter<EngineEvent> {
        self.inner.emitter.read().clone()
    }

    /// Registers `listener` for entering `state`.
    ///
    /// Listeners belong to the current connection and are dropped by
    /// `disconnect`. A failing listener rolls the transition back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceAlreadyDisposed`] if the emitter is disposed.
    pub fn on_state(&self, state: ConnectionState, listener: &Listener<EngineEvent>) -> Result<()> {
        self.emitter().on(EventKey::State(state), listener)
    }

    /// Removes `listener` for entering `state`.
    pub fn off_state(&self, state: ConnectionState, listener: &Listener<EngineEvent>) {
        self.emitter()
            .off(&EventKey::State(state), Some(listener));
    }

    /// Subscribes to the notifications of live query `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceAlreadyDisposed`] if the emitter is disposed.
    pub fn subscribe(&self, id: LiveId) -> Result<LiveSubscription> {
        LiveSubscription::register(self.emitter(), id)
    }
}

// ============================================================================
// Client - Lifecycle
// ============================================================================

impl Client {
    /// Connects to `endpoint`.
    ///
    /// The path is normalized to end in `/rpc`. Connecting again to the
    /// open endpoint does nothing.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if `endpoint` is not a URL
    /// - [`Error::ConnectionConflict`] if open to a different endpoint
    /// - [`Error::UnsupportedProtocol`] if no engine handles the scheme
    /// - Any error of the engine's `connect`
    pub async fn connect(&self, endpoint: &str, options: ConnectOptions) -> Result<()> {
        let endpoint = rpc_endpoint(endpoint)?;
        let _guard = self.inner.lifecycle.lock().await;

        if self.state() == ConnectionState::Open {
            let current = self.endpoint().ok_or_else(Error::connection_unavailable)?;
            if current == endpoint {
                return Ok(());
            }
            return Err(Error::connection_conflict(current, endpoint));
        }

        let emitter = self.emitter();
        emitter.on(EventKey::Error, &self.inner.error_listener)?;

        let engine = self.inner.registry.create(
            endpoint.scheme(),
            EngineConfig {
                emitter,
                formatter: Arc::clone(&self.inner.formatter),
                validator: Arc::clone(&self.inner.validator),
            },
        )?;
        *self.inner.engine.write() = Some(Arc::clone(&engine));

        let signal = signal_or_timeout(options.signal, self.inner.options.connect_timeout);
        info!(%endpoint, engine = engine.name(), "Connecting");

        match engine.connect(endpoint, &signal).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(error = %e, "Connect failed, releasing engine");
                *self.inner.engine.write() = None;
                Err(e)
            }
        }
    }

    /// Disconnects.
    ///
    /// With `force`, in-flight listener tasks are aborted with
    /// [`Error::EngineDisconnected`] first. The emitter is disposed and
    /// replaced and the engine released whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnect`] carrying the failure of the engine's
    /// disconnect and the listener failures collected by disposal.
    pub async fn disconnect(&self, options: DisconnectOptions) -> Result<Disconnected> {
        let _guard = self.inner.lifecycle.lock().await;

        let result = match self.engine() {
            Some(engine) if engine.state() != ConnectionState::Closed => {
                self.shutdown(engine.as_ref(), options).await
            }
            _ => Ok(Disconnected::AlreadyDisconnected),
        };

        *self.inner.emitter.write() = TaskEmitter::new();
        *self.inner.engine.write() = None;

        result
    }

    async fn shutdown(&self, engine: &dyn Engine, options: DisconnectOptions) -> Result<Disconnected> {
        let emitter = self.emitter();
        let signal = signal_or_timeout(options.signal, self.inner.options.disconnect_timeout);

        if options.force {
            debug!("Aborting in-flight listeners");
            emitter.abort(Error::EngineDisconnected);
        }

        let disconnect = engine.disconnect(&signal).await;
        let dispose = emitter.dispose().await;

        match (disconnect, dispose) {
            (Ok(_), Ok(())) => {
                info!("Disconnected");
                Ok(Disconnected::Disconnected)
            }
            (disconnect, dispose) => Err(Error::Disconnect {
                disconnect: disconnect.err().map(Box::new),
                dispose: dispose.err(),
            }),
        }
    }
}

/// Parses `endpoint` and makes its path end in the RPC route.
fn rpc_endpoint(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)?;

    if !url.path().ends_with(&format!("/{RPC_ROUTE}")) {
        let mut path = url.path().to_string();
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(RPC_ROUTE);
        url.set_path(&path);
    }

    Ok(url)
}

// ============================================================================
// Client - RPC
// ============================================================================

impl Client {
    /// Calls `method` and returns its result.
    ///
    /// A call made while connecting waits for the connection to open.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionUnavailable`] if not connected, or the
    ///   connection closes instead of opening
    /// - [`Error::RpcResponse`] if the server answers with an error
    /// - The signal's reason (by default [`Error::Timeout`]) if it aborts
    /// - Any validation or transport error of the engine
    pub async fn rpc(&self, method: &str, params: Vec<Value>, options: RpcOptions) -> Result<Value> {
        let signal = signal_or_timeout(options.signal, self.inner.options.rpc_timeout);

        if self.state() == ConnectionState::Connecting {
            let emitter = self.emitter();
            let opened = emitter.once(EventKey::State(ConnectionState::Open), Some(&signal));
            let closed = emitter.once(EventKey::State(ConnectionState::Closed), Some(&signal));

            if self.state() == ConnectionState::Connecting {
                tokio::select! {
                    result = opened => {
                        result?;
                    }
                    result = closed => {
                        result?;
                        return Err(Error::connection_unavailable_because("Connection closed"));
                    }
                }
            }
        }

        let engine = self.engine().ok_or_else(Error::connection_unavailable)?;
        let response = engine
            .rpc(RpcRequest::new(method, params), &signal)
            .await?;

        response.into_result()
    }

    /// Calls `method` and deserializes its result.
    ///
    /// # Errors
    ///
    /// As [`Client::rpc`], plus [`Error::Json`] if the result does not
    /// deserialize into `T`.
    pub async fn rpc_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
        options: RpcOptions,
    ) -> Result<T> {
        let value = self.rpc(method, params, options).await?;
        Ok(serde_json::from_value(value)?)
    }
}

// ============================================================================
// Client - Session
// ============================================================================

impl Client {
    /// Selects a namespace and/or database.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingNamespace`] if a database is selected before
    /// any namespace.
    pub async fn use_ns_db(&self, namespace: Option<&str>, database: Option<&str>) -> Result<()> {
        let params = vec![optional(namespace), optional(database)];
        self.rpc(method::USE, params, RpcOptions::default())
            .await
            .map(drop)
    }

    /// Defines session variable `name`.
    pub async fn set(&self, name: &str, value: Value) -> Result<()> {
        let params = vec![Value::from(name), value];
        self.rpc(method::LET, params, RpcOptions::default())
            .await
            .map(drop)
    }

    /// Removes session variable `name`.
    pub async fn unset(&self, name: &str) -> Result<()> {
        self.rpc(method::UNSET, vec![Value::from(name)], RpcOptions::default())
            .await
            .map(drop)
    }

    /// Runs a query with optional variables.
    pub async fn query(&self, text: &str, vars: Option<Map<String, Value>>) -> Result<Value> {
        let mut params = vec![Value::from(text)];
        if let Some(vars) = vars {
            params.push(Value::Object(vars));
        }
        self.rpc(method::QUERY, params, RpcOptions::default()).await
    }

    /// Signs in and returns the session token.
    pub async fn signin(&self, credentials: Value) -> Result<String> {
        self.rpc_as(method::SIGNIN, vec![credentials], RpcOptions::default())
            .await
    }

    /// Signs up and returns the session token.
    pub async fn signup(&self, credentials: Value) -> Result<String> {
        self.rpc_as(method::SIGNUP, vec![credentials], RpcOptions::default())
            .await
    }

    /// Authenticates the session with `token`.
    pub async fn authenticate(&self, token: &str) -> Result<()> {
        self.rpc(method::AUTHENTICATE, vec![Value::from(token)], RpcOptions::default())
            .await
            .map(drop)
    }

    /// Drops the session's authentication.
    pub async fn invalidate(&self) -> Result<()> {
        self.rpc(method::INVALIDATE, vec![], RpcOptions::default())
            .await
            .map(drop)
    }
}

#[inline]
fn optional(value: Option<&str>) -> Value {
    value.map_or(Value::Null, Value::from)
}

// ============================================================================
// Tests
// ============================================================================
