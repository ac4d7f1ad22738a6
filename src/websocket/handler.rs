use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::auth::{authenticate, AuthFailure, Principal};
use crate::connection_manager::{ConnectionHandle, ConnectionRegistry};
use crate::error::AppError;
use crate::metrics::{ConnectionMetrics, WsMessageMetrics};
use crate::server::AppState;
use crate::telemetry::attributes;

use super::message::{ClientMessage, OutboundFrame, ServerMessage};

const MAX_ROOM_NAME_LEN: usize = 64;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler
///
/// The credential is verified before the upgrade; a rejected handshake
/// never creates a connection handle.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let token = extract_token(&query, &headers);

    let principal = match authenticate(state.authenticator.as_ref(), token.as_deref()).await {
        Ok(principal) => principal,
        Err(e) => {
            ConnectionMetrics::record_rejected(rejection_reason(&e));
            tracing::warn!(error = %e, "WebSocket handshake rejected");
            return AppError::Auth(e).into_response();
        }
    };

    tracing::info!(user_id = %principal.user_id, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| handle_socket(socket, state, principal))
}

/// Token from the `token` query parameter, else a Bearer Authorization header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query.token.as_deref().filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn rejection_reason(failure: &AuthFailure) -> &'static str {
    match failure {
        AuthFailure::MissingToken => "missing_token",
        AuthFailure::InvalidToken(_) => "invalid_token",
        AuthFailure::MissingSubject => "missing_subject",
    }
}

/// Drive one authenticated session until either side goes away
#[tracing::instrument(
    name = "ws.connection",
    skip(socket, state, principal),
    fields(
        user_id = %principal.user_id,
        otel.kind = "server"
    )
)]
async fn handle_socket(socket: WebSocket, state: AppState, principal: Principal) {
    let connection_start = std::time::Instant::now();
    let user_id = principal.user_id;

    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(state.settings.websocket.channel_buffer_size.max(1));
    let handle = Arc::new(ConnectionHandle::new(user_id.clone(), tx));

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let connection_id = match state.registry.register(handle.clone()) {
        Ok(id) => id,
        Err(e) => {
            ConnectionMetrics::record_rejected("limit");
            tracing::warn!(user_id = %user_id, error = %e, "Connection rejected");
            let reply = ServerMessage::error(e.code(), e.to_string());
            if let Ok(json) = serde_json::to_string(&reply) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };

    let span = tracing::Span::current();
    let attr = attributes::user_id(&user_id);
    span.set_attribute(attr.key, attr.value);
    let attr = attributes::connection_id(connection_id);
    span.set_attribute(attr.key, attr.value);

    ConnectionMetrics::record_opened();
    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        "WebSocket connection established"
    );

    let _ = handle
        .send(ServerMessage::connection_established(connection_id, &user_id))
        .await;

    // Writer: drains the outbound channel until the handle is closed, then
    // flushes what is already queued and sends a close frame. A write that
    // is still blocked `send_timeout` after the close is abandoned.
    let send_timeout = state.settings.websocket.send_timeout();
    let writer_handle = handle.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    tokio::select! {
                        result = write_frame(&mut ws_sender, &frame) => {
                            if result.is_err() {
                                break;
                            }
                        }
                        _ = closed_grace(&writer_handle, send_timeout) => {
                            tracing::debug!(connection_id = %writer_handle.id, "Abandoning stalled write");
                            break;
                        }
                    }
                }
                _ = writer_handle.wait_closed() => {
                    let flush = async {
                        while let Ok(frame) = rx.try_recv() {
                            if write_frame(&mut ws_sender, &frame).await.is_err() {
                                return;
                            }
                        }
                        let _ = ws_sender.send(Message::Close(None)).await;
                    };
                    let _ = tokio::time::timeout(send_timeout, flush).await;
                    break;
                }
            }
        }
    });

    let reader_registry = state.registry.clone();
    let reader_handle = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &reader_registry, &reader_handle).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    let send_done = tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
            recv_task.abort();
            true
        }
        _ = &mut recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
            false
        }
    };

    // Closing the handle also wakes the writer so it can send a close frame
    state.registry.unregister(connection_id);
    if !send_done {
        let _ = send_task.await;
    }

    let duration = connection_start.elapsed().as_secs_f64();
    ConnectionMetrics::record_closed(duration);

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        duration_secs = duration,
        "WebSocket connection closed"
    );
}

async fn closed_grace(handle: &ConnectionHandle, grace: Duration) {
    handle.wait_closed().await;
    tokio::time::sleep(grace).await;
}

async fn write_frame(
    ws_sender: &mut SplitSink<WebSocket, Message>,
    frame: &OutboundFrame,
) -> Result<(), axum::Error> {
    let text = match frame.to_json() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize message");
            return Ok(());
        }
    };
    ws_sender.send(Message::Text(text.into())).await
}

/// Process a received WebSocket message
/// Returns false if the connection should be closed
async fn process_message(
    msg: Message,
    registry: &ConnectionRegistry,
    handle: &Arc<ConnectionHandle>,
) -> bool {
    match msg {
        Message::Text(text) => {
            handle.update_activity();
            let reply = handle_control_text(registry, handle, text.as_str()).await;
            let _ = handle.send(reply).await;
            true
        }
        Message::Binary(_) => {
            handle.update_activity();
            WsMessageMetrics::record_malformed();
            let _ = handle
                .send(ServerMessage::error(
                    "UNSUPPORTED_FORMAT",
                    "Binary messages are not supported",
                ))
                .await;
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            // axum answers pings itself
            handle.update_activity();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            false
        }
    }
}

/// Handle one inbound text frame and build the reply envelope.
///
/// Every outcome is a reply; malformed input never closes the session.
pub async fn handle_control_text(
    registry: &ConnectionRegistry,
    handle: &ConnectionHandle,
    text: &str,
) -> ServerMessage {
    let msg = match ClientMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            WsMessageMetrics::record_malformed();
            tracing::debug!(connection_id = %handle.id, error = %e, "Invalid client message");
            return ServerMessage::error("INVALID_MESSAGE", e.to_string());
        }
    };

    WsMessageMetrics::record(msg.kind());
    handle_client_message(msg, registry, handle).await
}

#[tracing::instrument(
    name = "ws.message",
    skip(registry, handle),
    fields(
        connection_id = %handle.id,
        user_id = %handle.user_id,
        message_type = msg.kind()
    )
)]
async fn handle_client_message(
    msg: ClientMessage,
    registry: &ConnectionRegistry,
    handle: &ConnectionHandle,
) -> ServerMessage {
    match msg {
        ClientMessage::Ping => ServerMessage::pong(),
        ClientMessage::JoinRoom { room } => handle_join(room, registry, handle),
        ClientMessage::LeaveRoom { room } => handle_leave(room, registry, handle),
        ClientMessage::SubscribeNotifications { types } => {
            let current = handle.set_subscriptions(types).await;
            tracing::debug!(subscriptions = ?current, "Notification filter updated");
            ServerMessage::subscription_updated(current)
        }
    }
}

fn handle_join(room: String, registry: &ConnectionRegistry, handle: &ConnectionHandle) -> ServerMessage {
    if !is_valid_room_name(&room) {
        tracing::warn!(connection_id = %handle.id, room = %room, "Invalid room name");
        return invalid_room(&room);
    }

    match registry.join(handle.id, &room) {
        Ok(_) => {
            let attr = attributes::room(&room);
            tracing::Span::current().set_attribute(attr.key, attr.value);
            tracing::info!(connection_id = %handle.id, room = %room, "Joined room");
            ServerMessage::room_joined(&room)
        }
        Err(e) => {
            tracing::warn!(
                connection_id = %handle.id,
                room = %room,
                error = %e,
                "Failed to join room"
            );
            ServerMessage::error(e.code(), e.to_string())
        }
    }
}

fn handle_leave(room: String, registry: &ConnectionRegistry, handle: &ConnectionHandle) -> ServerMessage {
    if !is_valid_room_name(&room) {
        return invalid_room(&room);
    }

    if registry.leave(handle.id, &room) {
        tracing::info!(connection_id = %handle.id, room = %room, "Left room");
    }
    ServerMessage::room_left(&room)
}

fn invalid_room(room: &str) -> ServerMessage {
    ServerMessage::error(
        "INVALID_ROOM",
        format!(
            "Invalid room name: {:?} (1-{} chars of A-Z a-z 0-9 . _ -)",
            room, MAX_ROOM_NAME_LEN
        ),
    )
}

/// Room names: 1-64 ASCII alphanumerics, dash, underscore or dot
pub fn is_valid_room_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_ROOM_NAME_LEN {
        return false;
    }

    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
