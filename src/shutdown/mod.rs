//! Graceful shutdown for the realtime hub.
//!
//! 1. Announce the shutdown to every connected client
//! 2. Stop background tasks
//! 3. Give clients time to disconnect on their own
//! 4. Close whatever is left

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::connection_manager::ConnectionRegistry;
use crate::notification::{NotificationDispatcher, OutboundMessage};

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Upper bound for delivering the shutdown announcement
    pub client_notification_timeout: Duration,
    /// Time clients get to disconnect before being closed
    pub drain_timeout: Duration,
    /// Suggested reconnect delay sent to clients
    pub reconnect_after_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            client_notification_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            reconnect_after_seconds: 5,
        }
    }
}

pub struct GracefulShutdown {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<NotificationDispatcher>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<NotificationDispatcher>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self::with_config(registry, dispatcher, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<NotificationDispatcher>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            shutdown_tx,
            config,
        }
    }

    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.registry.connection_count())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Notifying clients");
        result.clients_notified = self.notify_clients(reason).await;

        tracing::info!("Phase 2: Signaling background tasks to stop");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 3: Waiting for connections to close");
        result.connections_closed = self.wait_for_connections_to_close().await;

        result.connections_forced = self.close_remaining();

        result.duration = start.elapsed();
        result.success = true;

        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            connections_forced = result.connections_forced,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    async fn notify_clients(&self, reason: &str) -> usize {
        if self.registry.connection_count() == 0 {
            return 0;
        }

        let message = OutboundMessage::system_announcement(json!({
            "message": "Server is shutting down",
            "reason": reason,
            "reconnect_after_seconds": self.config.reconnect_after_seconds,
        }));

        match timeout(
            self.config.client_notification_timeout,
            self.dispatcher.broadcast_all(&message),
        )
        .await
        {
            Ok(report) => {
                tracing::info!(
                    notified = report.delivered,
                    total = report.attempted,
                    "Shutdown notifications sent"
                );
                report.delivered
            }
            Err(_) => {
                tracing::warn!("Timed out sending shutdown notifications");
                0
            }
        }
    }

    async fn wait_for_connections_to_close(&self) -> usize {
        let initial = self.registry.connection_count();
        if initial == 0 {
            return 0;
        }

        let wait_future = async {
            while self.registry.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        let _ = timeout(self.config.drain_timeout, wait_future).await;

        initial.saturating_sub(self.registry.connection_count())
    }

    /// Unregister every remaining connection; their sessions close the sockets
    fn close_remaining(&self) -> usize {
        let remaining = self.registry.all_connections();
        if remaining.is_empty() {
            return 0;
        }

        tracing::warn!(
            remaining_connections = remaining.len(),
            "Closing connections that did not disconnect"
        );

        remaining
            .into_iter()
            .filter(|id| self.registry.unregister(*id))
            .count()
    }
}

#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    pub clients_notified: usize,
    /// Connections closed by clients during the drain window
    pub connections_closed: usize,
    /// Connections closed by the server after the drain window
    pub connections_forced: usize,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::{MessageType, OutboundFrame};
    use tokio::sync::mpsc;

    fn components() -> (Arc<ConnectionRegistry>, Arc<NotificationDispatcher>, broadcast::Sender<()>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(NotificationDispatcher::new(registry.clone()));
        let (tx, _) = broadcast::channel(1);
        (registry, dispatcher, tx)
    }

    #[tokio::test]
    async fn test_shutdown_no_connections() {
        let (registry, dispatcher, tx) = components();
        let result = GracefulShutdown::new(registry, dispatcher, tx)
            .execute("test shutdown")
            .await;

        assert!(result.success);
        assert_eq!(result.clients_notified, 0);
        assert_eq!(result.connections_closed, 0);
        assert_eq!(result.connections_forced, 0);
    }

    #[tokio::test]
    async fn test_shutdown_announces_and_closes() {
        let (registry, dispatcher, tx) = components();
        let mut stop_rx = tx.subscribe();

        let (conn_tx, mut conn_rx) = mpsc::channel(4);
        let handle = registry.connect("user-1", conn_tx).unwrap();

        let config = ShutdownConfig {
            drain_timeout: Duration::from_millis(50),
            ..ShutdownConfig::default()
        };
        let result = GracefulShutdown::with_config(registry.clone(), dispatcher, tx, config)
            .execute("maintenance")
            .await;

        assert_eq!(result.clients_notified, 1);
        assert_eq!(result.connections_forced, 1);
        assert!(handle.is_closed());
        assert_eq!(registry.connection_count(), 0);
        assert!(stop_rx.try_recv().is_ok());

        let frame = conn_rx.recv().await.unwrap();
        let json: serde_json::Value = match frame {
            OutboundFrame::Message(msg) => serde_json::to_value(msg).unwrap(),
            OutboundFrame::Encoded(text) => serde_json::from_str(&text).unwrap(),
        };
        assert_eq!(
            json["type"],
            serde_json::to_value(MessageType::SystemAnnouncement).unwrap()
        );
        assert_eq!(json["data"]["reason"], "maintenance");
    }
}
