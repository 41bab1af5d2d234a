//! `tokio-tungstenite` backed socket.
//!
//! [`TungsteniteFactory`] spawns one event loop task per socket. The loop
//! owns the WebSocket stream and handles:
//!
//! - The client handshake, negotiating the formatter's sub-protocol
//! - Incoming frames, forwarded as [`SocketEvent`]s
//! - Outgoing frames and close requests from [`TungsteniteSocket`]
//! - The final [`SocketEvent::Close`], sent exactly once

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::Payload;

use super::socket::{
    AtomicReadyState, CLOSE_ABNORMAL, CLOSE_NO_STATUS, CLOSE_NORMAL, ReadyState, SocketConnection,
    SocketEvent, SocketFactory, SocketHandle,
};

// ============================================================================
// Constants
// ============================================================================

/// How long to wait for the server's close frame after sending ours.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// SocketCommand
// ============================================================================

/// Internal commands for the event loop.
#[derive(Debug)]
enum SocketCommand {
    /// Send a frame.
    Send(Payload),
    /// Start the close handshake.
    Close { code: u16, reason: String },
}

// ============================================================================
// TungsteniteFactory
// ============================================================================

/// Default [`SocketFactory`] built on `tokio-tungstenite`.
///
/// `wss://` endpoints need the `wss` feature.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteFactory;

#[async_trait]
impl SocketFactory for TungsteniteFactory {
    async fn create(&self, url: &Url, protocol: Option<&str>) -> Result<SocketConnection> {
        let mut request = url.as_str().into_client_request()?;

        if let Some(protocol) = protocol {
            let value = HeaderValue::from_str(protocol)
                .map_err(|e| Error::config(format!("invalid sub-protocol {protocol:?}: {e}")))?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicReadyState::default());

        tokio::spawn(run_event_loop(
            request,
            event_tx,
            command_rx,
            Arc::clone(&state),
            CLOSE_HANDSHAKE_TIMEOUT,
        ));

        Ok(SocketConnection {
            events: event_rx,
            handle: Arc::new(TungsteniteSocket { command_tx, state }),
        })
    }
}

// ============================================================================
// TungsteniteSocket
// ============================================================================

/// Handle to a socket driven by the event loop.
#[derive(Debug)]
pub struct TungsteniteSocket {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<SocketCommand>,
    /// State shared with the event loop.
    state: Arc<AtomicReadyState>,
}

impl SocketHandle for TungsteniteSocket {
    fn send(&self, payload: Payload) -> Result<()> {
        if self.state.load() != ReadyState::Open {
            return Err(Error::connection_unavailable_because("socket is not open"));
        }

        self.command_tx
            .send(SocketCommand::Send(payload))
            .map_err(|_| Error::connection_unavailable_because("socket event loop stopped"))
    }

    fn close(&self, code: u16, reason: &str) {
        if self.state.load().is_closing_or_closed() {
            return;
        }

        self.state.store(ReadyState::Closing);
        let _ = self.command_tx.send(SocketCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }

    fn ready_state(&self) -> ReadyState {
        self.state.load()
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Event loop that owns the WebSocket stream.
///
/// Once a close is requested the peer has `close_timeout` to answer,
/// however many frames it keeps sending meanwhile.
async fn run_event_loop(
    request: Request,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
    state: Arc<AtomicReadyState>,
    close_timeout: Duration,
) {
    let ws_stream = match connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake failed");
            state.store(ReadyState::Closed);
            let _ = event_tx.send(SocketEvent::Error(e.to_string()));
            let _ = event_tx.send(SocketEvent::Close {
                code: CLOSE_ABNORMAL,
                reason: String::new(),
            });
            return;
        }
    };

    // A close requested during the handshake wins over opening.
    if state.load() == ReadyState::Connecting {
        state.store(ReadyState::Open);
        let _ = event_tx.send(SocketEvent::Open);
    }

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let mut commands_open = true;
    let mut requested_close: Option<(u16, String)> = None;
    let mut close_deadline: Option<Instant> = None;

    let (code, reason) = loop {
        tokio::select! {
            // Incoming frames
            message = ws_read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let _ = event_tx.send(SocketEvent::Message(Payload::Text(text.as_str().to_owned())));
                    }

                    Some(Ok(Message::Binary(bytes))) => {
                        let _ = event_tx.send(SocketEvent::Message(Payload::Binary(bytes.to_vec())));
                    }

                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "WebSocket closed by remote");
                        break match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                            None => requested_close.take().unwrap_or((CLOSE_NO_STATUS, String::new())),
                        };
                    }

                    Some(Err(e)) => {
                        if let Some(close) = requested_close.take() {
                            break close;
                        }
                        warn!(error = %e, "WebSocket error");
                        let _ = event_tx.send(SocketEvent::Error(e.to_string()));
                        break (CLOSE_ABNORMAL, String::new());
                    }

                    None => {
                        debug!("WebSocket stream ended");
                        break requested_close.take().unwrap_or((CLOSE_ABNORMAL, String::new()));
                    }

                    // Ping/Pong are answered by tungstenite
                    _ => {}
                }
            }

            // Commands from the handle
            command = command_rx.recv(), if commands_open => {
                match command {
                    Some(SocketCommand::Send(payload)) => {
                        let message = match payload {
                            Payload::Text(text) => Message::Text(text.into()),
                            Payload::Binary(bytes) => Message::Binary(bytes.into()),
                        };

                        if let Err(e) = ws_write.send(message).await {
                            warn!(error = %e, "Failed to send frame");
                            let _ = event_tx.send(SocketEvent::Error(e.to_string()));
                            break (CLOSE_ABNORMAL, String::new());
                        }
                        trace!("Frame sent");
                    }

                    Some(SocketCommand::Close { code, reason }) => {
                        debug!(code, "Closing WebSocket");
                        commands_open = false;
                        requested_close = Some((code, reason.clone()));
                        close_deadline = Some(Instant::now() + close_timeout);

                        let frame = CloseFrame {
                            code: code.into(),
                            reason: reason.into(),
                        };
                        if ws_write.send(Message::Close(Some(frame))).await.is_err() {
                            break requested_close.take().unwrap_or((CLOSE_ABNORMAL, String::new()));
                        }
                    }

                    None => {
                        debug!("Socket handle dropped");
                        commands_open = false;
                        requested_close = Some((CLOSE_NORMAL, String::new()));
                        close_deadline = Some(Instant::now() + close_timeout);
                        let _ = ws_write.send(Message::Close(None)).await;
                    }
                }
            }

            // The peer never answered our close frame
            () = sleep_until(close_deadline.unwrap_or_else(Instant::now)), if close_deadline.is_some() => {
                debug!("Close handshake timed out");
                break requested_close.take().unwrap_or((CLOSE_ABNORMAL, String::new()));
            }
        }
    };

    let _ = timeout(close_timeout, ws_write.close()).await;
    state.store(ReadyState::Closed);
    let _ = event_tx.send(SocketEvent::Close { code, reason });

    debug!(code, "Event loop terminated");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn next_event(connection: &mut SocketConnection) -> SocketEvent {
        timeout(Duration::from_secs(5), connection.events.recv())
            .await
            .expect("event in time")
            .expect("event")
    }

    #[tokio::test]
    async fn test_handshake_failure_reports_error_then_close() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}/rpc")).expect("url");
        let mut connection = TungsteniteFactory
            .create(&url, Some("json"))
            .await
            .expect("create");

        assert!(matches!(next_event(&mut connection).await, SocketEvent::Error(_)));
        assert_eq!(
            next_event(&mut connection).await,
            SocketEvent::Close {
                code: CLOSE_ABNORMAL,
                reason: String::new()
            }
        );
        assert_eq!(connection.handle.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_echo_and_close_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("handshake");
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() {
                    ws.send(message).await.expect("echo");
                }
            }
        });

        let url = Url::parse(&format!("ws://{addr}/rpc")).expect("url");
        let mut connection = TungsteniteFactory.create(&url, None).await.expect("create");

        assert_eq!(next_event(&mut connection).await, SocketEvent::Open);
        assert_eq!(connection.handle.ready_state(), ReadyState::Open);

        connection
            .handle
            .send(Payload::from("hello"))
            .expect("send");
        assert_eq!(
            next_event(&mut connection).await,
            SocketEvent::Message(Payload::from("hello"))
        );

        connection.handle.close(CLOSE_NORMAL, "bye");
        assert!(connection.handle.send(Payload::from("late")).is_err());

        match next_event(&mut connection).await {
            SocketEvent::Close { code, .. } => assert_eq!(code, CLOSE_NORMAL),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(connection.handle.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_close_times_out_while_peer_keeps_sending() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        // Streams unmasked one-byte text frames and never reads, so our
        // close frame is never answered.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("handshake");
            loop {
                if ws.get_mut().write_all(&[0x81, 0x01, b'x']).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let url = Url::parse(&format!("ws://{addr}/rpc")).expect("url");
        let request = url.as_str().into_client_request().expect("request");
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicReadyState::default());
        tokio::spawn(run_event_loop(
            request,
            event_tx,
            command_rx,
            Arc::clone(&state),
            Duration::from_millis(200),
        ));
        let mut connection = SocketConnection {
            events: event_rx,
            handle: Arc::new(TungsteniteSocket { command_tx, state }),
        };

        assert_eq!(next_event(&mut connection).await, SocketEvent::Open);
        let started = Instant::now();
        connection.handle.close(CLOSE_NORMAL, "bye");

        loop {
            match next_event(&mut connection).await {
                SocketEvent::Close { code, .. } => {
                    assert_eq!(code, CLOSE_NORMAL);
                    break;
                }
                SocketEvent::Message(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(connection.handle.ready_state(), ReadyState::Closed);
    }
}
