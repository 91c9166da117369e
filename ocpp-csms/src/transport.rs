//! Transport abstraction over one device's socket
//!
//! The registry and the connection loop only ever talk to a [`Transport`]:
//! send a text frame, receive the next one, close, and ask whether the
//! socket is still open. The production implementation wraps an accepted
//! `tokio-tungstenite` WebSocket stream; tests use a channel-backed double.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Errors on the transport layer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    Ws(String),
}

/// One device's transport session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame
    async fn send(&self, frame: &str) -> Result<(), TransportError>;

    /// Receive the next text frame. `None` means the stream ended.
    async fn receive(&self) -> Option<Result<String, TransportError>>;

    /// Close the transport. Idempotent.
    async fn close(&self, reason: &str);

    /// Whether the transport is still in an open state
    fn is_open(&self) -> bool;
}

/// WebSocket-backed transport for an accepted connection
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<TcpStream>>>,
    open: AtomicBool,
}

impl WsTransport {
    pub fn new(ws: WebSocketStream<TcpStream>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, frame: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| {
                self.mark_closed();
                TransportError::Ws(e.to_string())
            })
    }

    async fn receive(&self) -> Option<Result<String, TransportError>> {
        let mut stream = self.stream.lock().await;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        debug!("ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) => {
                    self.mark_closed();
                    return None;
                }
                Some(Err(e)) => {
                    self.mark_closed();
                    return Some(Err(TransportError::Ws(e.to_string())));
                }
                None => {
                    self.mark_closed();
                    return None;
                }
            }
        }
    }

    async fn close(&self, reason: &str) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!("close frame not delivered: {}", e);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
