//! Prometheus metrics for the realtime hub.
//!
//! - Connection metrics (active connections, users, rooms, lifetimes)
//! - Message metrics (sent by target, delivered, failed by reason)
//! - WebSocket control message metrics
//! - Heartbeat metrics

mod helpers;

pub use helpers::{encode_metrics, ConnectionMetrics, HeartbeatMetrics, MessageMetrics, WsMessageMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "fintech_hub";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Total number of active WebSocket connections
    pub static ref CONNECTIONS_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_connections_total", METRIC_PREFIX),
        "Total number of active WebSocket connections"
    ).unwrap();

    /// Number of unique connected users
    pub static ref USERS_CONNECTED: IntGauge = register_int_gauge!(
        format!("{}_users_connected", METRIC_PREFIX),
        "Number of unique connected users"
    ).unwrap();

    /// Room memberships across all rooms. Room names are client-chosen, so
    /// there is no per-room series.
    pub static ref ROOM_MEMBERSHIPS: IntGauge = register_int_gauge!(
        format!("{}_room_memberships", METRIC_PREFIX),
        "Total number of connection-room memberships"
    ).unwrap();

    /// Rooms with at least one member
    pub static ref ROOMS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_rooms_active", METRIC_PREFIX),
        "Total number of rooms with at least one member"
    ).unwrap();

    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections established"
    ).unwrap();

    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    /// Handshakes rejected before a connection was created
    pub static ref WS_HANDSHAKES_REJECTED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_handshakes_rejected_total", METRIC_PREFIX),
        "Total WebSocket handshakes rejected",
        &["reason"]
    ).unwrap();

    pub static ref WS_CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_ws_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket connection lifetime in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]
    ).unwrap();

    // ============================================================================
    // Message Metrics
    // ============================================================================

    /// Messages dispatched by target type
    pub static ref MESSAGES_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_sent_total", METRIC_PREFIX),
        "Total messages dispatched",
        &["target"]
    ).unwrap();

    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Total messages successfully handed to connections"
    ).unwrap();

    pub static ref MESSAGES_FAILED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_failed_total", METRIC_PREFIX),
        "Total per-connection delivery failures",
        &["reason"]
    ).unwrap();

    /// Control messages received from clients, by type
    pub static ref WS_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_messages_received_total", METRIC_PREFIX),
        "Total control messages received from clients",
        &["type"]
    ).unwrap();

    // ============================================================================
    // Heartbeat Metrics
    // ============================================================================

    pub static ref HEARTBEAT_DURATION_MS: Histogram = register_histogram!(
        format!("{}_heartbeat_duration_ms", METRIC_PREFIX),
        "Duration of one heartbeat round in milliseconds",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]
    ).unwrap();

    pub static ref HEARTBEAT_FAILURES: IntCounter = register_int_counter!(
        format!("{}_heartbeat_failures_total", METRIC_PREFIX),
        "Total heartbeat sends that failed or timed out"
    ).unwrap();

    pub static ref STALE_CONNECTIONS_REMOVED: IntCounter = register_int_counter!(
        format!("{}_stale_connections_removed_total", METRIC_PREFIX),
        "Total connections removed for inactivity"
    ).unwrap();
}
