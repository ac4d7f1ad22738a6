//! Room and connection query endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::connection_manager::{RoomInfo, UserConnectionInfo};
use crate::error::{AppError, Result};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct RoomListResponse {
    pub rooms: Vec<RoomInfo>,
    pub total_rooms: usize,
}

/// GET /api/v1/rooms - List rooms with member counts
pub async fn list_rooms(State(state): State<AppState>) -> Json<RoomListResponse> {
    let rooms = state.registry.list_rooms();
    let total_rooms = rooms.len();

    Json(RoomListResponse { rooms, total_rooms })
}

/// GET /api/v1/rooms/{name}
pub async fn get_room(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RoomInfo>> {
    state
        .registry
        .room_info(&name)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Room '{}' not found or has no members", name)))
}

/// GET /api/v1/users/{user_id}/connections
pub async fn get_user_connections(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserConnectionInfo>> {
    state
        .registry
        .user_info(&user_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("User '{}' has no active connections", user_id)))
}
