use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use relayterm_protocol::{ConnectParams, ControlMessage, Frame, FrameCodec, Framing, WireMessage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::registry::SessionRegistry;
use crate::session::{ConnectionRef, ConnectionSink, SessionId};

/// Shared state for the HTTP/WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    registries: Arc<BTreeMap<String, Arc<SessionRegistry>>>,
    default_framing: Framing,
    outbound_queue: usize,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        let registries = config
            .kinds
            .iter()
            .map(|kind| {
                let registry = SessionRegistry::new(kind.clone(), config.idle_timeout)
                    .with_orphan_reaping(config.reap_orphans_on_fresh_connect);
                (kind.name.clone(), Arc::new(registry))
            })
            .collect();

        Self {
            registries: Arc::new(registries),
            default_framing: config.default_framing,
            outbound_queue: config.outbound_queue,
        }
    }

    pub fn registry(&self, kind: &str) -> Option<Arc<SessionRegistry>> {
        self.registries.get(kind).cloned()
    }

    pub fn registries(&self) -> Vec<Arc<SessionRegistry>> {
        self.registries.values().cloned().collect()
    }

    /// Close every session of every kind.
    pub async fn shutdown(&self) {
        for registry in self.registries.values() {
            registry.shutdown().await;
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/terminal/{kind}", get(terminal_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Empty origin list means any origin may connect.
pub fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    if origins.is_empty() {
        return Ok(CorsLayer::permissive());
    }
    let origins = origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("invalid CORS origin: {}", origin))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET])
        .allow_headers(Any))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: BTreeMap<String, usize>,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut sessions = BTreeMap::new();
    for (kind, registry) in state.registries.iter() {
        sessions.insert(kind.clone(), registry.len().await);
    }
    Json(HealthResponse {
        status: "ok",
        sessions,
    })
}

async fn terminal_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(registry) = state.registry(&kind) else {
        debug!(kind = %kind, "Rejecting connection for unknown terminal kind");
        return StatusCode::NOT_FOUND.into_response();
    };
    let codec = FrameCodec::new(params.framing.unwrap_or(state.default_framing));
    let queue = state.outbound_queue;

    ws.on_upgrade(move |socket| handle_terminal_socket(socket, registry, params, codec, queue))
}

/// Drive one terminal WebSocket from attach to disconnect.
pub async fn handle_terminal_socket(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    params: ConnectParams,
    codec: FrameCodec,
    queue: usize,
) {
    let (conn, sink) = ConnectionRef::new(params.client_id.clone(), queue);
    let (ws_sender, mut ws_receiver) = socket.split();
    let mut writer = tokio::spawn(write_outbound(ws_sender, sink, codec));

    let attachment = match registry.attach(params.session_id.as_deref(), &conn).await {
        Ok(attachment) => attachment,
        Err(e) => {
            error!(kind = %registry.kind().name, conn = %conn.id(), "Failed to attach: {}", e);
            conn.close(e.close_code(), e.to_string());
            let _ = writer.await;
            return;
        }
    };
    let session_id = attachment.session.id();
    info!(
        session = %session_id,
        conn = %conn.id(),
        framing = %codec.framing(),
        reconnected = attachment.reconnected,
        "Terminal connection open"
    );

    let mut writer_done = false;
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let wire = match msg {
                    Some(Ok(Message::Text(text))) => WireMessage::Text(text.to_string()),
                    Some(Ok(Message::Binary(bytes))) => WireMessage::Binary(bytes.to_vec()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(conn = %conn.id(), "WebSocket receive error: {}", e);
                        break;
                    }
                };
                dispatch(&registry, session_id, &conn, &codec, wire).await;
            }
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    registry.unbind(session_id, conn.id()).await;
    if !writer_done {
        writer.abort();
    }
    info!(session = %session_id, conn = %conn.id(), "Terminal connection closed");
}

async fn dispatch(
    registry: &SessionRegistry,
    session_id: SessionId,
    conn: &ConnectionRef,
    codec: &FrameCodec,
    wire: WireMessage,
) {
    match codec.decode(wire) {
        Ok(Frame::Data(bytes)) => {
            if let Err(e) = registry.write_input(session_id, conn.id(), &bytes).await {
                debug!(session = %session_id, "Input not delivered: {}", e);
            }
        }
        Ok(Frame::Control(ControlMessage::Resize { cols, rows })) => {
            if let Err(e) = registry.resize(session_id, conn.id(), cols, rows).await {
                debug!(session = %session_id, "Resize not applied: {}", e);
            }
        }
        Ok(Frame::Control(other)) => {
            debug!(conn = %conn.id(), "Ignoring client control message: {:?}", other);
        }
        Err(e) => {
            warn!(conn = %conn.id(), "Dropping undecodable frame: {}", e);
        }
    }
}

/// Drain a connection's outbound queue onto the socket.
///
/// A close request flushes whatever was queued before it, then sends the
/// close frame.
async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut sink: ConnectionSink,
    codec: FrameCodec,
) {
    loop {
        tokio::select! {
            biased;
            changed = sink.close.changed() => {
                let signal = match changed {
                    Ok(()) => sink.close.borrow_and_update().clone(),
                    Err(_) => None,
                };
                while let Ok(frame) = sink.frames.try_recv() {
                    if send_frame(&mut sender, &codec, &frame).await.is_err() {
                        return;
                    }
                }
                if let Some(signal) = signal {
                    let close = Message::Close(Some(CloseFrame {
                        code: signal.code,
                        reason: signal.reason.into(),
                    }));
                    if let Err(e) = sender.send(close).await {
                        debug!("Failed to send close frame: {}", e);
                    }
                }
                break;
            }
            frame = sink.frames.recv() => match frame {
                Some(frame) => {
                    if send_frame(&mut sender, &codec, &frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    codec: &FrameCodec,
    frame: &Frame,
) -> Result<(), axum::Error> {
    let message = match codec.encode(frame) {
        Ok(WireMessage::Text(text)) => Message::Text(text.into()),
        Ok(WireMessage::Binary(bytes)) => Message::Binary(bytes.into()),
        Err(e) => {
            error!("Failed to encode frame: {}", e);
            return Ok(());
        }
    };
    sender.send(message).await
}
