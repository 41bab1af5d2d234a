//! In-process transports for unit tests.
//!
//! | Double | Stands in for |
//! |--------|---------------|
//! | [`MockFetcher`] | [`ReqwestFetcher`](crate::transport::ReqwestFetcher) |
//! | [`MockSocketFactory`] / [`MockServer`] | [`TungsteniteFactory`](crate::transport::TungsteniteFactory) |

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::engine::{EngineConfig, EngineEvent};
use crate::error::{Error, Result};
use crate::protocol::{BasicValidator, JsonFormatter, Payload};
use crate::task::TaskEmitter;
use crate::transport::{
    AtomicReadyState, FetchRequest, FetchResponse, Fetcher, ReadyState, SocketConnection,
    SocketEvent, SocketFactory, SocketHandle,
};

/// Builds an engine config with the JSON formatter and basic validator.
pub fn engine_config(emitter: TaskEmitter<EngineEvent>) -> EngineConfig {
    EngineConfig {
        emitter,
        formatter: Arc::new(JsonFormatter),
        validator: Arc::new(BasicValidator),
    }
}

/// Installs a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MockFetcher
// ============================================================================

/// Scripted [`Fetcher`].
///
/// Replies with queued responses in order, then with `{"result": null}`.
#[derive(Debug, Default)]
pub struct MockFetcher {
    responses: Mutex<VecDeque<FetchResponse>>,
    requests: Mutex<Vec<(Url, FetchRequest)>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a raw response.
    pub fn respond(&self, status: u16, body: Vec<u8>) {
        self.responses.lock().push_back(FetchResponse { status, body });
    }

    /// Queues a JSON response.
    pub fn respond_json(&self, status: u16, body: Value) {
        self.respond(status, body.to_string().into_bytes());
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn last_request(&self) -> Option<FetchRequest> {
        self.requests.lock().last().map(|(_, request)| request.clone())
    }

    pub fn last_url(&self) -> Option<Url> {
        self.requests.lock().last().map(|(url, _)| url.clone())
    }

    /// Returns the JSON body of the last request.
    pub fn last_body(&self) -> Option<Value> {
        self.last_request()
            .and_then(|request| serde_json::from_slice(request.body.as_bytes()).ok())
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, endpoint: &Url, request: FetchRequest) -> Result<FetchResponse> {
        request.signal.check()?;
        self.requests.lock().push((endpoint.clone(), request));

        let response = self.responses.lock().pop_front();
        Ok(response.unwrap_or_else(|| FetchResponse {
            status: 200,
            body: br#"{"result":null}"#.to_vec(),
        }))
    }
}

// ============================================================================
// MockSocketFactory
// ============================================================================

/// [`SocketFactory`] handing the server side of every socket to the test.
#[derive(Debug)]
pub struct MockSocketFactory {
    auto_open: bool,
    servers: mpsc::UnboundedSender<MockServer>,
}

impl MockSocketFactory {
    /// Creates a factory and the stream of server sides it creates.
    ///
    /// With `auto_open`, every socket opens as soon as it is created.
    pub fn new(auto_open: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { auto_open, servers }), rx)
    }
}

#[async_trait]
impl SocketFactory for MockSocketFactory {
    async fn create(&self, url: &Url, protocol: Option<&str>) -> Result<SocketConnection> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicReadyState::default());
        let closes = Arc::new(Mutex::new(Vec::new()));

        let server = MockServer {
            url: url.clone(),
            protocol: protocol.map(str::to_string),
            events: event_tx.clone(),
            frames: frame_rx,
            state: Arc::clone(&state),
            closes: Arc::clone(&closes),
        };
        if self.auto_open {
            server.open();
        }
        let _ = self.servers.send(server);

        Ok(SocketConnection {
            events: event_rx,
            handle: Arc::new(MockSocket {
                events: event_tx,
                frames: frame_tx,
                state,
                closes,
            }),
        })
    }
}

/// Client side of a mock socket.
#[derive(Debug)]
struct MockSocket {
    events: mpsc::UnboundedSender<SocketEvent>,
    frames: mpsc::UnboundedSender<Payload>,
    state: Arc<AtomicReadyState>,
    closes: Arc<Mutex<Vec<(u16, String)>>>,
}

impl SocketHandle for MockSocket {
    fn send(&self, payload: Payload) -> Result<()> {
        if self.state.load() != ReadyState::Open {
            return Err(Error::connection_unavailable_because("Socket is not open"));
        }
        self.frames
            .send(payload)
            .map_err(|_| Error::connection_unavailable_because("Server side dropped"))
    }

    /// Closes at once, as if the server acknowledged immediately.
    fn close(&self, code: u16, reason: &str) {
        if self.state.load().is_closing_or_closed() {
            return;
        }
        self.state.store(ReadyState::Closed);
        self.closes.lock().push((code, reason.to_string()));
        let _ = self.events.send(SocketEvent::Close {
            code,
            reason: reason.to_string(),
        });
    }

    fn ready_state(&self) -> ReadyState {
        self.state.load()
    }
}

// ============================================================================
// MockServer
// ============================================================================

/// Server side of a mock socket.
#[derive(Debug)]
pub struct MockServer {
    url: Url,
    protocol: Option<String>,
    events: mpsc::UnboundedSender<SocketEvent>,
    frames: mpsc::UnboundedReceiver<Payload>,
    state: Arc<AtomicReadyState>,
    closes: Arc<Mutex<Vec<(u16, String)>>>,
}

impl MockServer {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Close calls made by the client, in order.
    pub fn closes(&self) -> Vec<(u16, String)> {
        self.closes.lock().clone()
    }

    pub fn open(&self) {
        self.state.store(ReadyState::Open);
        let _ = self.events.send(SocketEvent::Open);
    }

    pub fn send_json(&self, value: Value) {
        let _ = self
            .events
            .send(SocketEvent::Message(Payload::Text(value.to_string())));
    }

    pub fn send_raw(&self, payload: Payload) {
        let _ = self.events.send(SocketEvent::Message(payload));
    }

    /// Reports a socket error.
    pub fn fail(&self, message: &str) {
        let _ = self.events.send(SocketEvent::Error(message.to_string()));
    }

    /// Closes from the server side.
    pub fn close(&self, code: u16, reason: &str) {
        if self.state.load() == ReadyState::Closed {
            return;
        }
        self.state.store(ReadyState::Closed);
        let _ = self.events.send(SocketEvent::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Waits for the next frame sent by the client.
    pub async fn recv_json(&mut self) -> Value {
        let payload = tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("frame within 5s")
            .expect("socket still attached");
        serde_json::from_slice(payload.as_bytes()).expect("JSON frame")
    }

    /// Returns an already sent frame, if any.
    pub fn try_recv_json(&mut self) -> Option<Value> {
        let payload = self.frames.try_recv().ok()?;
        serde_json::from_slice(payload.as_bytes()).ok()
    }

    /// Answers every request with `handler`'s result.
    pub fn serve<F>(self, handler: F) -> JoinHandle<()>
    where
        F: Fn(&Value) -> Value + Send + 'static,
    {
        self.serve_with(move |request| Ok(handler(request)))
    }

    /// Answers every request with a result or an `(code, message)` error.
    pub fn serve_with<F>(mut self, handler: F) -> JoinHandle<()>
    where
        F: Fn(&Value) -> std::result::Result<Value, (i64, String)> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(payload) = self.frames.recv().await {
                let Ok(request) = serde_json::from_slice::<Value>(payload.as_bytes()) else {
                    continue;
                };
                let reply = match handler(&request) {
                    Ok(result) => json!({ "id": request["id"], "result": result }),
                    Err((code, message)) => json!({
                        "id": request["id"],
                        "error": { "code": code, "message": message },
                    }),
                };
                self.send_json(reply);
            }
        })
    }
}
