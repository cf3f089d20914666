//! WebSocket handling
//!
//! Two kinds of sockets: `/host` carries the task engine's ask/say stream and
//! our replies, `/ui` serves panels. Both are thin pipes into the coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use convoy_protocol::{ClientMessage, HostMessage, ServerMessage, WebviewMessage};

use crate::command::CoordinatorCommand;
use crate::state::AppState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const OUTBOUND_CAPACITY: usize = 100;

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    /// To a panel
    Json(ServerMessage),
    /// To the task host
    Host(WebviewMessage),
    /// Raw pong response
    Pong(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Peer {
    Host,
    Panel,
}

impl Peer {
    fn as_str(self) -> &'static str {
        match self {
            Peer::Host => "host",
            Peer::Panel => "panel",
        }
    }
}

/// `/host` upgrade handler
pub async fn host_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Peer::Host))
}

/// `/ui` upgrade handler
pub async fn ui_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Peer::Panel))
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snap = state.coordinator().snapshot();
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "instanceId": snap.instance_id,
        "taskActive": snap.task_active,
        "messages": snap.message_count,
        "pendingAsk": snap.ui.pending_ask,
        "broker": snap.presence.broker,
        "instanceCount": snap.presence.instance_count,
        "rollCallComplete": snap.presence.roll_call_complete,
    }))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, peer: Peer) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        peer = peer.as_str(),
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let frame = match msg {
                OutboundMessage::Pong(data) => Ok(Message::Pong(data)),
                OutboundMessage::Json(server_msg) => {
                    serde_json::to_string(&server_msg).map(|json| Message::Text(json.into()))
                }
                OutboundMessage::Host(host_msg) => {
                    serde_json::to_string(&host_msg).map(|json| Message::Text(json.into()))
                }
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    error!(
                        component = "websocket",
                        event = "ws.send.serialize_failed",
                        connection_id = conn_id,
                        error = %e,
                        "Failed to serialize outbound message"
                    );
                    continue;
                }
            };

            if ws_tx.send(frame).await.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let coordinator = state.coordinator().clone();
    let forward_task = match peer {
        Peer::Host => spawn_forwarder(
            coordinator.subscribe_host(),
            outbound_tx.clone(),
            OutboundMessage::Host,
            conn_id,
        ),
        Peer::Panel => {
            let Some(subscription) = coordinator.subscribe_panel().await else {
                warn!(
                    component = "websocket",
                    event = "ws.subscribe.failed",
                    connection_id = conn_id,
                    "Coordinator unavailable, closing panel socket"
                );
                send_task.abort();
                return;
            };
            let _ = outbound_tx
                .send(OutboundMessage::Json(subscription.snapshot))
                .await;
            spawn_forwarder(
                subscription.rx,
                outbound_tx.clone(),
                OutboundMessage::Json,
                conn_id,
            )
        }
    };

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let parsed = match peer {
            Peer::Host => {
                serde_json::from_str::<HostMessage>(text.as_str()).map(CoordinatorCommand::Host)
            }
            Peer::Panel => {
                serde_json::from_str::<ClientMessage>(text.as_str()).map(CoordinatorCommand::Panel)
            }
        };

        match parsed {
            Ok(cmd) => coordinator.send(cmd).await,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    peer = peer.as_str(),
                    error = %e,
                    payload_bytes = text.as_str().len(),
                    payload_preview = %truncate_for_log(text.as_str(), 240),
                    "Failed to parse inbound message"
                );
                if peer == Peer::Panel {
                    let _ = outbound_tx
                        .send(OutboundMessage::Json(ServerMessage::Error {
                            code: "parse_error".into(),
                            message: e.to_string(),
                        }))
                        .await;
                }
            }
        }
    }

    forward_task.abort();
    send_task.abort();
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        peer = peer.as_str(),
        "WebSocket connection closed"
    );
}

/// Pump a coordinator broadcast into one socket's outbound queue.
fn spawn_forwarder<T: Clone + Send + 'static>(
    mut rx: broadcast::Receiver<T>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    wrap: fn(T) -> OutboundMessage,
    conn_id: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if outbound_tx.send(wrap(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "websocket",
                        event = "ws.forward.lagged",
                        connection_id = conn_id,
                        skipped,
                        "Subscriber lagged, messages skipped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{truncated}…")
    } else {
        truncated
    }
}
