use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::timeout;

use crate::connection_manager::{ConnectionHandle, ConnectionRegistry};
use crate::metrics::MessageMetrics;
use crate::websocket::{OutboundFrame, ServerMessage};

use super::{DeliveryFailure, DeliveryReport, FailureReason, OutboundMessage, Target};

/// Maximum number of concurrent message sends
const MAX_CONCURRENT_SENDS: usize = 100;

/// Fan-outs at least this wide share one encoded frame
const PRESERIALIZATION_THRESHOLD: usize = 4;

/// Default time a single connection gets to accept a message
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(2000);

/// Statistics for the notification dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Total messages dispatched
    pub total_sent: AtomicU64,
    /// Total successful deliveries (connection count)
    pub total_delivered: AtomicU64,
    /// Total failed deliveries
    pub total_failed: AtomicU64,
    pub user_messages: AtomicU64,
    pub room_messages: AtomicU64,
    pub broadcast_messages: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            user_messages: self.user_messages.load(Ordering::Relaxed),
            room_messages: self.room_messages.load(Ordering::Relaxed),
            broadcast_messages: self.broadcast_messages.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: &DeliveryReport) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        self.total_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.total_failed
            .fetch_add(report.failed() as u64, Ordering::Relaxed);

        let counter = match report.target {
            Target::User(_) => &self.user_messages,
            Target::Room(_) => &self.room_messages,
            Target::Broadcast => &self.broadcast_messages,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub total_sent: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub user_messages: u64,
    pub room_messages: u64,
    pub broadcast_messages: u64,
}

/// Fans messages out to connected clients.
///
/// Delivery is best-effort per connection: a connection that is closed or
/// too slow is unregistered and reported, the rest still get the message.
pub struct NotificationDispatcher {
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
    stats: DispatcherStats,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_send_timeout(registry, DEFAULT_SEND_TIMEOUT)
    }

    pub fn with_send_timeout(registry: Arc<ConnectionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
            stats: DispatcherStats::default(),
        }
    }

    /// Get dispatcher statistics
    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Route a message by its own target
    #[tracing::instrument(
        name = "dispatcher.dispatch",
        skip(self, message),
        fields(message_id = %message.id(), kind = %message.kind(), target = message.target().label())
    )]
    pub async fn dispatch(&self, message: OutboundMessage) -> DeliveryReport {
        match message.target().clone() {
            Target::User(user_id) => self.send_to_user(&user_id, &message).await,
            Target::Room(room) => self.send_to_room(&room, &message).await,
            Target::Broadcast => self.broadcast_all(&message).await,
        }
    }

    /// Deliver to every live connection of one user
    #[tracing::instrument(
        name = "dispatcher.send_to_user",
        skip(self, message),
        fields(message_id = %message.id(), kind = %message.kind())
    )]
    pub async fn send_to_user(&self, user_id: &str, message: &OutboundMessage) -> DeliveryReport {
        let connections = self.registry.user_handles(user_id);
        let report = self
            .deliver(Target::User(user_id.to_string()), &connections, message)
            .await;

        MessageMetrics::record_user_sent();
        self.finish(&report);

        tracing::debug!(
            user_id = %user_id,
            delivered = report.delivered,
            failed = report.failed(),
            "Sent message to user"
        );

        report
    }

    /// Deliver to every member of a room
    #[tracing::instrument(
        name = "dispatcher.send_to_room",
        skip(self, message),
        fields(message_id = %message.id(), kind = %message.kind())
    )]
    pub async fn send_to_room(&self, room: &str, message: &OutboundMessage) -> DeliveryReport {
        let connections = self.registry.room_handles(room);
        let report = self
            .deliver(Target::Room(room.to_string()), &connections, message)
            .await;

        MessageMetrics::record_room_sent();
        self.finish(&report);

        tracing::debug!(
            room = %room,
            delivered = report.delivered,
            failed = report.failed(),
            "Sent message to room"
        );

        report
    }

    /// Deliver to every registered connection
    #[tracing::instrument(
        name = "dispatcher.broadcast_all",
        skip(self, message),
        fields(message_id = %message.id(), kind = %message.kind())
    )]
    pub async fn broadcast_all(&self, message: &OutboundMessage) -> DeliveryReport {
        let connections = self.registry.all_handles();
        let report = self.deliver(Target::Broadcast, &connections, message).await;

        MessageMetrics::record_broadcast_sent();
        self.finish(&report);

        tracing::debug!(
            delivered = report.delivered,
            failed = report.failed(),
            "Broadcast message to all connections"
        );

        report
    }

    fn finish(&self, report: &DeliveryReport) {
        self.stats.record(report);
        MessageMetrics::record_delivered(report.delivered as u64);
        for failure in &report.failures {
            MessageMetrics::record_failure(failure.reason.as_str());
        }
    }

    /// Send to a snapshot of connections and unregister the ones that fail.
    /// No registry lock is held here.
    async fn deliver(
        &self,
        target: Target,
        connections: &[Arc<ConnectionHandle>],
        message: &OutboundMessage,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::empty(message.id(), target);
        if connections.is_empty() {
            return report;
        }

        let server_message = message.to_server_message();
        let frame = if connections.len() >= PRESERIALIZATION_THRESHOLD {
            match OutboundFrame::preserialized(&server_message) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to pre-serialize message, falling back to per-connection serialization");
                    OutboundFrame::Message(server_message)
                }
            }
        } else {
            OutboundFrame::Message(server_message)
        };

        report.attempted = connections.len();

        let mut in_flight = FuturesUnordered::new();
        for conn in connections {
            in_flight.push(send_one(conn.clone(), frame.clone(), self.send_timeout));

            while in_flight.len() >= MAX_CONCURRENT_SENDS {
                match in_flight.next().await {
                    Some(outcome) => self.absorb(&mut report, outcome),
                    None => break,
                }
            }
        }

        while let Some(outcome) = in_flight.next().await {
            self.absorb(&mut report, outcome);
        }

        report
    }

    fn absorb(&self, report: &mut DeliveryReport, outcome: SendOutcome) {
        match outcome.failure {
            None => report.delivered += 1,
            Some(reason) => {
                let handle = outcome.handle;
                tracing::warn!(
                    connection_id = %handle.id,
                    user_id = %handle.user_id,
                    reason = reason.as_str(),
                    "Delivery failed, dropping connection"
                );
                self.registry.unregister(handle.id);
                report.failures.push(DeliveryFailure {
                    connection_id: handle.id,
                    user_id: handle.user_id.clone(),
                    reason,
                });
            }
        }
    }
}

struct SendOutcome {
    handle: Arc<ConnectionHandle>,
    failure: Option<FailureReason>,
}

async fn send_one(handle: Arc<ConnectionHandle>, frame: OutboundFrame, limit: Duration) -> SendOutcome {
    let failure = match timeout(limit, handle.send_frame(frame)).await {
        Ok(Ok(())) => None,
        Ok(Err(_)) => Some(FailureReason::Closed),
        Err(_) => Some(FailureReason::TimedOut),
    };
    SendOutcome { handle, failure }
}

/// Send one message directly to one connection, with the same failure
/// handling as a fan-out.
pub async fn send_direct(
    registry: &ConnectionRegistry,
    handle: &Arc<ConnectionHandle>,
    message: ServerMessage,
    limit: Duration,
) -> Result<(), FailureReason> {
    let outcome = send_one(handle.clone(), OutboundFrame::Message(message), limit).await;
    match outcome.failure {
        None => Ok(()),
        Some(reason) => {
            registry.unregister(handle.id);
            Err(reason)
        }
    }
}
