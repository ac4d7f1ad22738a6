use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;
use crate::triggers::{
    broadcast_announcement, broadcast_balance, broadcast_market, broadcast_notification,
    broadcast_transaction, dispatch_message,
};

use super::connection::{get_room, get_user_connections, list_rooms};
use super::health::{health, stats};
use super::metrics::prometheus_metrics;

/// Read-only endpoints
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        .nest(
            "/api/v1",
            Router::new()
                .route("/rooms", get(list_rooms))
                .route("/rooms/{name}", get(get_room))
                .route("/users/{user_id}/connections", get(get_user_connections)),
        )
}

/// Admin endpoints that publish messages; the caller adds API key auth
pub fn trigger_routes() -> Router<AppState> {
    Router::new().nest(
        "/api/v1",
        Router::new()
            .route("/broadcast/notification", post(broadcast_notification))
            .route("/broadcast/transaction", post(broadcast_transaction))
            .route("/broadcast/balance", post(broadcast_balance))
            .route("/broadcast/market", post(broadcast_market))
            .route("/broadcast/announcement", post(broadcast_announcement))
            .route("/dispatch", post(dispatch_message)),
    )
}
