//! CSMS WebSocket server
//!
//! Accepts charging station connections, negotiates the protocol
//! generation once per connection, then runs one receive loop per
//! connection: inbound CALLs go to the dispatcher and the reply is framed
//! back on the same socket; inbound CALLRESULT/CALLERROR frames resolve
//! pending server-initiated commands. A frame that cannot be decoded gets
//! a framed CALLERROR back - the connection itself is kept open.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use crate::command::CommandService;
use crate::config::CsmsConfig;
use crate::dispatch::{ActionDispatcher, HandlerRegistry};
use crate::protocol::{
    negotiate, CallError, Envelope, ErrorCode, HandshakeInfo, NegotiationSource,
    ProtocolGeneration,
};
use crate::registry::{Connection, ConnectionRegistry, StatusSink};
use crate::transport::WsTransport;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Aborts the wrapped task when dropped, so sweeps stop with the server
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The CSMS connection endpoint
pub struct CsmsServer {
    config: CsmsConfig,
    registry: Arc<ConnectionRegistry>,
    handlers: Arc<HandlerRegistry>,
    commands: Arc<CommandService>,
}

impl CsmsServer {
    pub fn new(
        config: CsmsConfig,
        handlers: HandlerRegistry,
        status_sink: Option<Arc<dyn StatusSink>>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(config.stale_after, status_sink));
        let commands = Arc::new(CommandService::new(registry.clone()));

        // Every removal path funnels through the registry's teardown, so
        // one hook covers explicit removes, broadcast failures, loop exits
        // and evictions alike.
        let store = commands.store().clone();
        registry.set_on_removed(move |device_id| {
            store.cancel_for_device(device_id);
        });

        Arc::new(Self {
            config,
            registry,
            handlers: Arc::new(handlers),
            commands,
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The command submission surface for administrative callers
    pub fn commands(&self) -> &Arc<CommandService> {
        &self.commands
    }

    /// Bind and serve until the future is dropped. Both sweep tasks live
    /// exactly as long as this future.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("CSMS listening on {}", self.config.listen_addr);

        let _eviction = TaskGuard(self.registry.spawn_sweeper(self.config.eviction_interval));
        let _expiry = TaskGuard(
            self.commands
                .spawn_sweeper(self.config.command_sweep_interval),
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer).await;
                    });
                }
                Err(e) => {
                    // Transient accept failures (fd exhaustion etc.) must
                    // not kill the endpoint
                    warn!("accept failed: {}", e);
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut info = HandshakeInfo::default();
        let mut echoed_subprotocol: Option<String> = None;

        let callback = |request: &Request, mut response: Response| {
            info.path = request.uri().path().to_string();
            info.query = request.uri().query().map(str::to_string);
            info.subprotocols = request
                .headers()
                .get_all(header::SEC_WEBSOCKET_PROTOCOL)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| value.split(','))
                .map(|proto| proto.trim().to_string())
                .filter(|proto| !proto.is_empty())
                .collect();
            info.version_header = request
                .headers()
                .get("x-ocpp-version")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            info.user_agent = request
                .headers()
                .get(header::USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            if info.device_id().is_none() {
                let mut reject = ErrorResponse::new(Some("missing device id in path".into()));
                *reject.status_mut() = StatusCode::BAD_REQUEST;
                return Err(reject);
            }

            // Echo the first recognized offered sub-protocol verbatim
            let matched = info
                .subprotocols
                .iter()
                .find(|proto| ProtocolGeneration::from_alias(proto).is_some())
                .cloned();
            if let Some(proto) = matched {
                if let Ok(value) = HeaderValue::from_str(&proto) {
                    response
                        .headers_mut()
                        .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                }
                echoed_subprotocol = Some(proto);
            }

            Ok(response)
        };

        let ws_config = WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            max_frame_size: Some(self.config.max_frame_size),
            ..Default::default()
        };

        let ws = match accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let negotiated = negotiate(&info);
        let device_id = match info.device_id() {
            Some(id) => id.to_string(),
            // Checked in the callback; unreachable after a completed
            // handshake
            None => return,
        };

        if negotiated.source == NegotiationSource::Fallback {
            warn!(
                "{} gave no usable version hint, assuming {}",
                device_id,
                negotiated.generation
            );
        }

        let transport = Arc::new(WsTransport::new(ws));
        let connection = self
            .registry
            .register(&device_id, negotiated.generation, transport, peer)
            .await;
        if let Some(proto) = echoed_subprotocol {
            connection.set_meta("subprotocol", proto);
        }
        if let Some(agent) = info.user_agent.clone() {
            connection.set_meta("user_agent", agent);
        }

        let dispatcher = ActionDispatcher::new(negotiated.generation, self.handlers.clone());
        self.receive_loop(&connection, &dispatcher).await;

        // Only tear down state that still belongs to this connection; a
        // replacement registered under the same id stays untouched. The
        // teardown hook cancels the device's pending commands.
        self.registry.remove_exact(&device_id, &connection).await;
    }

    /// One device's frame-processing loop. Frames are handled strictly in
    /// arrival order; no lock is held across handler invocations, so a
    /// slow handler stalls only its own device.
    async fn receive_loop(&self, connection: &Arc<Connection>, dispatcher: &ActionDispatcher) {
        let codec = connection.generation().codec();
        let device_id = connection.device_id().to_string();

        while let Some(frame) = connection.transport().receive().await {
            let text = match frame {
                Ok(text) => text,
                Err(e) => {
                    warn!("transport error for {}: {}", device_id, e);
                    break;
                }
            };

            connection.touch();
            debug!("{} -> {}", device_id, text);

            match codec.decode(&text) {
                Ok(Envelope::Call(call)) => {
                    let reply = dispatcher.dispatch(&device_id, call).await;
                    let out = match codec.encode(&reply) {
                        Ok(out) => out,
                        Err(e) => {
                            error!("failed to encode reply for {}: {}", device_id, e);
                            continue;
                        }
                    };
                    if let Err(e) = connection.send(&out).await {
                        warn!("send to {} failed: {}", device_id, e);
                        break;
                    }
                }
                Ok(reply) => {
                    self.commands.resolve_reply(reply);
                }
                Err(e) => {
                    warn!("malformed frame from {}: {}", device_id, e);
                    let reply = Envelope::Error(CallError::new(
                        salvage_correlation_id(&text),
                        ErrorCode::FormatViolation,
                        e.to_string(),
                    ));
                    // Best effort; a bad frame never closes the connection
                    if let Ok(out) = codec.encode(&reply) {
                        let _ = connection.send(&out).await;
                    }
                }
            }
        }
    }
}

/// Pull a correlation id out of a frame that failed to decode, so the
/// error reply can still reference it. Empty when nothing is salvageable.
fn salvage_correlation_id(text: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return String::new();
    };

    let id = match &value {
        serde_json::Value::Array(items) => items.get(1).and_then(serde_json::Value::as_str),
        serde_json::Value::Object(object) => object.get("id").and_then(serde_json::Value::as_str),
        _ => None,
    };
    id.unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ActionHandler, HandlerError};
    use crate::transport::testing::MockTransport;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Heartbeat;

    #[async_trait]
    impl ActionHandler for Heartbeat {
        async fn handle(&self, _device_id: &str, _payload: Value) -> Result<Value, HandlerError> {
            Ok(json!({"currentTime": "2026-01-20T12:00:00Z"}))
        }
    }

    fn server(generation: ProtocolGeneration) -> (Arc<CsmsServer>, ActionDispatcher) {
        let handlers = HandlerRegistry::new().register_all("Heartbeat", Arc::new(Heartbeat));
        let server = CsmsServer::new(CsmsConfig::default(), handlers, None);
        let dispatcher = ActionDispatcher::new(generation, server.handlers.clone());
        (server, dispatcher)
    }

    async fn connect(
        server: &Arc<CsmsServer>,
        generation: ProtocolGeneration,
    ) -> (Arc<Connection>, Arc<MockTransport>, tokio::sync::mpsc::UnboundedSender<String>) {
        let (transport, feed) = MockTransport::new();
        let connection = server
            .registry
            .register("CP1", generation, transport.clone(), "127.0.0.1:9000".parse().unwrap())
            .await;
        (connection, transport, feed)
    }

    #[tokio::test]
    async fn array_heartbeat_round_trip() {
        let (server, dispatcher) = server(ProtocolGeneration::V16);
        let (connection, transport, feed) = connect(&server, ProtocolGeneration::V16).await;

        feed.send(r#"[2,"m1","Heartbeat",{}]"#.to_string()).unwrap();
        drop(feed);
        server.receive_loop(&connection, &dispatcher).await;

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0],
            r#"[3,"m1",{"currentTime":"2026-01-20T12:00:00Z"}]"#
        );
    }

    #[tokio::test]
    async fn rpc_heartbeat_round_trip() {
        let (server, dispatcher) = server(ProtocolGeneration::V20);
        let (connection, transport, feed) = connect(&server, ProtocolGeneration::V20).await;

        feed.send(r#"{"jsonrpc":"2.0","id":"m2","method":"Heartbeat","params":{}}"#.to_string())
            .unwrap();
        drop(feed);
        server.receive_loop(&connection, &dispatcher).await;

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 1);
        let reply: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(reply["jsonrpc"], "2.0");
        assert_eq!(reply["id"], "m2");
        assert_eq!(reply["result"]["currentTime"], "2026-01-20T12:00:00Z");
    }

    #[tokio::test]
    async fn unknown_action_gets_error_and_connection_survives() {
        let (server, dispatcher) = server(ProtocolGeneration::V16);
        let (connection, transport, feed) = connect(&server, ProtocolGeneration::V16).await;

        feed.send(r#"[2,"m1","NoSuchAction",{}]"#.to_string()).unwrap();
        feed.send(r#"[2,"m2","Heartbeat",{}]"#.to_string()).unwrap();
        drop(feed);
        server.receive_loop(&connection, &dispatcher).await;

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with(r#"[4,"m1","NotImplemented""#));
        assert!(frames[1].starts_with(r#"[3,"m2""#));
    }

    #[tokio::test]
    async fn malformed_frame_gets_framed_error_not_disconnect() {
        let (server, dispatcher) = server(ProtocolGeneration::V16);
        let (connection, transport, feed) = connect(&server, ProtocolGeneration::V16).await;

        feed.send(r#"[9,"m1","garbage"]"#.to_string()).unwrap();
        feed.send(r#"[2,"m2","Heartbeat",{}]"#.to_string()).unwrap();
        drop(feed);
        server.receive_loop(&connection, &dispatcher).await;

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with(r#"[4,"m1","FormatViolation""#));
        // the station still got its heartbeat reply on the same socket
        assert!(frames[1].starts_with(r#"[3,"m2""#));
    }

    #[tokio::test]
    async fn inbound_reply_resolves_pending_command() {
        let (server, dispatcher) = server(ProtocolGeneration::V16);
        let (connection, transport, feed) = connect(&server, ProtocolGeneration::V16).await;

        let (correlation_id, reply_rx) = server
            .commands()
            .submit("CP1", "Reset", json!({"type": "Soft"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(transport.sent_frames().len(), 1);

        // the device answers on the same socket, interleaved with its own
        // call (full duplex, correlated by id only)
        feed.send(r#"[2,"m7","Heartbeat",{}]"#.to_string()).unwrap();
        feed.send(format!(r#"[3,"{correlation_id}",{{"status":"Accepted"}}]"#))
            .unwrap();
        drop(feed);
        server.receive_loop(&connection, &dispatcher).await;

        match reply_rx.await.unwrap() {
            crate::command::CommandOutcome::Result(payload) => {
                assert_eq!(payload["status"], "Accepted")
            }
            other => panic!("expected Result, got {other:?}"),
        }
        // heartbeat reply also went out
        assert_eq!(transport.sent_frames().len(), 2);
    }

    #[tokio::test]
    async fn loop_exit_cancels_pending_and_removes_connection() {
        let (server, dispatcher) = server(ProtocolGeneration::V16);
        let (connection, _transport, feed) = connect(&server, ProtocolGeneration::V16).await;

        let (_, reply_rx) = server
            .commands()
            .submit("CP1", "Reset", json!({}), Duration::from_secs(30))
            .await
            .unwrap();

        drop(feed);
        server.receive_loop(&connection, &dispatcher).await;
        server.registry.remove_exact("CP1", &connection).await;

        assert!(matches!(
            reply_rx.await.unwrap(),
            crate::command::CommandOutcome::Cancelled
        ));
        assert_eq!(server.registry.count(), 0);
    }

    #[tokio::test]
    async fn broadcast_failure_cancels_pending_commands() {
        let (server, _dispatcher) = server(ProtocolGeneration::V16);
        let (_connection, transport, _feed) = connect(&server, ProtocolGeneration::V16).await;

        let (correlation_id, reply_rx) = server
            .commands()
            .submit("CP1", "Reset", json!({"type": "Soft"}), Duration::from_secs(30))
            .await
            .unwrap();

        // the socket dies; the next broadcast send fails and removes CP1
        transport.fail_sends();
        server.registry().broadcast("DataTransfer", json!({}), None).await;

        assert!(!server.commands().store().contains(&correlation_id));
        assert!(matches!(
            reply_rx.await.unwrap(),
            crate::command::CommandOutcome::Cancelled
        ));
        assert_eq!(server.registry().count(), 0);
    }

    #[tokio::test]
    async fn explicit_remove_cancels_pending_commands() {
        let (server, _dispatcher) = server(ProtocolGeneration::V16);
        let (_connection, _transport, _feed) = connect(&server, ProtocolGeneration::V16).await;

        let (correlation_id, reply_rx) = server
            .commands()
            .submit("CP1", "Reset", json!({}), Duration::from_secs(30))
            .await
            .unwrap();

        server.registry().remove("CP1").await;

        assert!(!server.commands().store().contains(&correlation_id));
        assert!(matches!(
            reply_rx.await.unwrap(),
            crate::command::CommandOutcome::Cancelled
        ));
    }

    #[test]
    fn salvage_correlation_id_shapes() {
        assert_eq!(salvage_correlation_id(r#"[9,"m1","x"]"#), "m1");
        assert_eq!(
            salvage_correlation_id(r#"{"jsonrpc":"2.0","id":"m2"}"#),
            "m2"
        );
        assert_eq!(salvage_correlation_id("not json"), "");
        assert_eq!(salvage_correlation_id(r#"{"no":"id"}"#), "");
    }
}
