//! HTTP publish handlers

use axum::{
    extract::{Query, State},
    Json,
};
use serde_json::Value;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::error::{AppError, Result};
use crate::notification::{OutboundMessage, Target};
use crate::server::AppState;
use crate::telemetry::attributes;
use crate::websocket::is_valid_room_name;

use super::models::{DispatchRequest, DispatchResponse, RoomQuery, UserQuery};

/// Notification to one user when `user_id` is given, otherwise to everyone
#[tracing::instrument(name = "http.broadcast_notification", skip(state, query, data))]
pub async fn broadcast_notification(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    Json(data): Json<Value>,
) -> Result<Json<DispatchResponse>> {
    let user_id = match query.user_id {
        Some(user_id) => Some(non_empty_user(user_id)?),
        None => None,
    };
    publish(&state, OutboundMessage::notification(object(data)?, user_id)).await
}

#[tracing::instrument(name = "http.broadcast_transaction", skip(state, query, data))]
pub async fn broadcast_transaction(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    Json(data): Json<Value>,
) -> Result<Json<DispatchResponse>> {
    let user_id = required_user(query)?;
    publish(&state, OutboundMessage::transaction_update(user_id, object(data)?)).await
}

#[tracing::instrument(name = "http.broadcast_balance", skip(state, query, data))]
pub async fn broadcast_balance(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    Json(data): Json<Value>,
) -> Result<Json<DispatchResponse>> {
    let user_id = required_user(query)?;
    publish(&state, OutboundMessage::balance_update(user_id, object(data)?)).await
}

/// Market data to a room, `market_data` unless `room` is given
#[tracing::instrument(name = "http.broadcast_market", skip(state, query, data))]
pub async fn broadcast_market(
    State(state): State<AppState>,
    Query(query): Query<RoomQuery>,
    Json(data): Json<Value>,
) -> Result<Json<DispatchResponse>> {
    if let Some(room) = &query.room {
        validate_room(room)?;
    }
    publish(&state, OutboundMessage::market_update(query.room, object(data)?)).await
}

#[tracing::instrument(name = "http.broadcast_announcement", skip(state, data))]
pub async fn broadcast_announcement(
    State(state): State<AppState>,
    Json(data): Json<Value>,
) -> Result<Json<DispatchResponse>> {
    publish(&state, OutboundMessage::system_announcement(object(data)?)).await
}

/// Publish with an explicit event type and target
#[tracing::instrument(
    name = "http.dispatch",
    skip(state, request),
    fields(kind = %request.kind, target = request.target.label())
)]
pub async fn dispatch_message(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>> {
    match &request.target {
        Target::User(user_id) if user_id.trim().is_empty() => {
            return Err(AppError::Validation("target user id must not be empty".into()));
        }
        Target::Room(room) => validate_room(room)?,
        _ => {}
    }

    let data = object(request.data)?;
    publish(&state, OutboundMessage::new(request.kind, data, request.target)).await
}

async fn publish(state: &AppState, message: OutboundMessage) -> Result<Json<DispatchResponse>> {
    let span = tracing::Span::current();
    let id = attributes::message_id(message.id());
    span.set_attribute(id.key, id.value);
    let kind = attributes::message_type(message.kind().as_str());
    span.set_attribute(kind.key, kind.value);
    let target = attributes::target_type(message.target().label());
    span.set_attribute(target.key, target.value);

    let event_kind = message.kind();
    let report = state.dispatcher.dispatch(message).await;

    let delivered = attributes::delivered_count(report.delivered);
    span.set_attribute(delivered.key, delivered.value);
    let failed = attributes::failed_count(report.failed());
    span.set_attribute(failed.key, failed.value);

    tracing::info!(
        message_id = %report.message_id,
        kind = %event_kind,
        target = report.target.label(),
        attempted = report.attempted,
        delivered = report.delivered,
        failed = report.failed(),
        "Message published via HTTP"
    );

    Ok(Json(DispatchResponse::from_report(event_kind, report)))
}

fn object(data: Value) -> Result<Value> {
    if data.is_object() {
        Ok(data)
    } else {
        Err(AppError::Validation("request body must be a JSON object".into()))
    }
}

fn required_user(query: UserQuery) -> Result<String> {
    let user_id = query
        .user_id
        .ok_or_else(|| AppError::Validation("user_id query parameter is required".into()))?;
    non_empty_user(user_id)
}

fn non_empty_user(user_id: String) -> Result<String> {
    if user_id.trim().is_empty() {
        return Err(AppError::Validation("user_id must not be empty".into()));
    }
    Ok(user_id)
}

fn validate_room(room: &str) -> Result<()> {
    if is_valid_room_name(room) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Invalid room name: {:?}", room)))
    }
}
