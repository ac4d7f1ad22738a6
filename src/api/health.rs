//! Health check and statistics endpoints.

use std::collections::HashMap;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::notification::DispatcherStatsSnapshot;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub unique_users: usize,
    pub rooms_count: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: ConnectionStatsResponse,
    pub messages: DispatcherStatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ConnectionStatsResponse {
    pub total_connections: usize,
    pub unique_users: usize,
    pub rooms: HashMap<String, usize>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let conn_stats = state.registry.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        connections: ConnectionHealthResponse {
            total: conn_stats.total_connections,
            unique_users: conn_stats.unique_users,
            rooms_count: conn_stats.rooms.len(),
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let conn_stats = state.registry.stats();

    Json(StatsResponse {
        connections: ConnectionStatsResponse {
            total_connections: conn_stats.total_connections,
            unique_users: conn_stats.unique_users,
            rooms: conn_stats.rooms,
        },
        messages: state.dispatcher.stats(),
    })
}
