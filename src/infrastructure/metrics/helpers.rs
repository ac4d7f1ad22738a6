//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::connection_manager::ConnectionStats;

use super::{
    CONNECTIONS_TOTAL, HEARTBEAT_DURATION_MS, HEARTBEAT_FAILURES, MESSAGES_DELIVERED_TOTAL,
    MESSAGES_FAILED_TOTAL, MESSAGES_SENT_TOTAL, ROOMS_ACTIVE, ROOM_MEMBERSHIPS,
    STALE_CONNECTIONS_REMOVED, USERS_CONNECTED, WS_CONNECTIONS_CLOSED, WS_CONNECTIONS_OPENED,
    WS_CONNECTION_DURATION, WS_HANDSHAKES_REJECTED, WS_MESSAGES_RECEIVED,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording dispatcher metrics
pub struct MessageMetrics;

impl MessageMetrics {
    pub fn record_user_sent() {
        MESSAGES_SENT_TOTAL.with_label_values(&["user"]).inc();
    }

    pub fn record_room_sent() {
        MESSAGES_SENT_TOTAL.with_label_values(&["room"]).inc();
    }

    pub fn record_broadcast_sent() {
        MESSAGES_SENT_TOTAL.with_label_values(&["broadcast"]).inc();
    }

    /// Record successful deliveries
    pub fn record_delivered(count: u64) {
        MESSAGES_DELIVERED_TOTAL.inc_by(count);
    }

    /// Record one failed delivery
    pub fn record_failure(reason: &str) {
        MESSAGES_FAILED_TOTAL.with_label_values(&[reason]).inc();
    }
}

/// Helper struct for connection lifecycle metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        WS_CONNECTIONS_OPENED.inc();
    }

    pub fn record_closed(duration_secs: f64) {
        WS_CONNECTIONS_CLOSED.inc();
        WS_CONNECTION_DURATION.observe(duration_secs);
    }

    pub fn record_rejected(reason: &str) {
        WS_HANDSHAKES_REJECTED.with_label_values(&[reason]).inc();
    }

    /// Refresh the gauges from a registry snapshot
    pub fn update_from_stats(stats: &ConnectionStats) {
        CONNECTIONS_TOTAL.set(stats.total_connections as i64);
        USERS_CONNECTED.set(stats.unique_users as i64);
        ROOMS_ACTIVE.set(stats.rooms.len() as i64);
        ROOM_MEMBERSHIPS.set(stats.rooms.values().sum::<usize>() as i64);
    }
}

/// Helper struct for client control message metrics
pub struct WsMessageMetrics;

impl WsMessageMetrics {
    pub fn record(kind: &str) {
        WS_MESSAGES_RECEIVED.with_label_values(&[kind]).inc();
    }

    pub fn record_malformed() {
        WS_MESSAGES_RECEIVED.with_label_values(&["malformed"]).inc();
    }
}

/// Helper struct for heartbeat metrics
pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    pub fn record_duration_ms(duration_ms: u64) {
        HEARTBEAT_DURATION_MS.observe(duration_ms as f64);
    }

    pub fn record_failures(count: u64) {
        HEARTBEAT_FAILURES.inc_by(count);
    }

    pub fn record_stale_removed(count: u64) {
        STALE_CONNECTIONS_REMOVED.inc_by(count);
    }
}
