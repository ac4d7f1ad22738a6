use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;

use crate::config::WebSocketConfig;
use crate::connection_manager::ConnectionRegistry;
use crate::metrics::{ConnectionMetrics, HeartbeatMetrics};
use crate::notification::send_direct;
use crate::websocket::ServerMessage;

/// Maximum concurrent heartbeat sends per batch
const MAX_CONCURRENT_HEARTBEATS: usize = 1000;

/// Background task for heartbeats and idle-connection cleanup
pub struct HeartbeatTask {
    config: WebSocketConfig,
    registry: Arc<ConnectionRegistry>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: WebSocketConfig,
        registry: Arc<ConnectionRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            registry,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut heartbeat_timer =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval.max(1)));
        let mut cleanup_timer =
            tokio::time::interval(Duration::from_secs(self.config.cleanup_interval.max(1)));

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            cleanup_interval_secs = self.config.cleanup_interval,
            connection_timeout_secs = self.config.connection_timeout,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats().await;
                    ConnectionMetrics::update_from_stats(&self.registry.stats());
                }
                _ = cleanup_timer.tick() => {
                    self.cleanup_stale_connections();
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Send a heartbeat envelope to every live connection.
    ///
    /// A connection that cannot accept it in time is unregistered, exactly
    /// like a failed fan-out delivery.
    async fn send_heartbeats(&self) -> usize {
        let connections = self.registry.all_handles();
        let total = connections.len();
        if total == 0 {
            return 0;
        }

        let start = Instant::now();
        let limit = self.config.send_timeout();
        let mut failed = 0usize;

        for batch in connections.chunks(MAX_CONCURRENT_HEARTBEATS) {
            let results = join_all(batch.iter().map(|handle| async move {
                let result =
                    send_direct(&self.registry, handle, ServerMessage::heartbeat(), limit).await;
                if let Err(reason) = &result {
                    tracing::debug!(
                        connection_id = %handle.id,
                        reason = reason.as_str(),
                        "Heartbeat failed, connection removed"
                    );
                }
                result
            }))
            .await;

            failed += results.iter().filter(|r| r.is_err()).count();
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        HeartbeatMetrics::record_duration_ms(elapsed_ms);
        if failed > 0 {
            HeartbeatMetrics::record_failures(failed as u64);
        }

        tracing::debug!(
            total = total,
            failed = failed,
            elapsed_ms = elapsed_ms,
            "Heartbeat round completed"
        );

        if elapsed_ms > self.config.heartbeat_interval * 1000 / 2 {
            tracing::warn!(
                elapsed_ms = elapsed_ms,
                heartbeat_interval_ms = self.config.heartbeat_interval * 1000,
                connections = total,
                "Heartbeat round took more than 50% of interval"
            );
        }

        failed
    }

    fn cleanup_stale_connections(&self) -> usize {
        let timeout_secs = self.config.connection_timeout;
        let removed = self.registry.cleanup_stale_connections(timeout_secs);

        if removed > 0 {
            HeartbeatMetrics::record_stale_removed(removed as u64);
            tracing::info!(
                removed = removed,
                timeout_secs = timeout_secs,
                "Cleaned up stale connections"
            );
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::{MessageType, OutboundFrame};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_heartbeat_task_shutdown() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = HeartbeatTask::new(WebSocketConfig::default(), registry, shutdown_rx);
        let handle = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Task should complete")
            .expect("Task should not panic");
    }

    #[tokio::test]
    async fn test_heartbeat_sends_to_connections() {
        let config = WebSocketConfig {
            heartbeat_interval: 1,
            ..Default::default()
        };
        let registry = Arc::new(ConnectionRegistry::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (tx, mut rx) = mpsc::channel::<OutboundFrame>(10);
        registry.connect("user-1", tx).unwrap();

        let task_handle = tokio::spawn(HeartbeatTask::new(config, registry, shutdown_rx).run());

        let frame = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("Should receive heartbeat")
            .expect("Channel should not be closed");

        match frame {
            OutboundFrame::Message(msg) => assert_eq!(msg.kind, MessageType::Heartbeat),
            other => panic!("unexpected frame: {:?}", other),
        }

        shutdown_tx.send(()).unwrap();
        let _ = task_handle.await;
    }

    #[tokio::test]
    async fn test_heartbeat_removes_dead_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (tx_live, _rx_live) = mpsc::channel(4);
        let (tx_dead, rx_dead) = mpsc::channel(4);
        let live = registry.connect("user-1", tx_live).unwrap();
        let dead = registry.connect("user-2", tx_dead).unwrap();
        registry.join(dead.id, "market_data").unwrap();
        drop(rx_dead);

        let task = HeartbeatTask::new(WebSocketConfig::default(), registry.clone(), shutdown_rx);
        let failed = task.send_heartbeats().await;

        assert_eq!(failed, 1);
        assert!(registry.contains(live.id));
        assert!(!registry.contains(dead.id));
        assert!(dead.is_closed());
        assert!(registry.members_of("market_data").is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_idle_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (tx, _rx) = mpsc::channel(4);
        let idle = registry.connect("user-1", tx).unwrap();
        idle.set_last_activity(chrono::Utc::now() - chrono::Duration::seconds(600));

        let config = WebSocketConfig {
            connection_timeout: 120,
            ..Default::default()
        };
        let task = HeartbeatTask::new(config, registry.clone(), shutdown_rx);

        assert_eq!(task.cleanup_stale_connections(), 1);
        assert_eq!(registry.connection_count(), 0);
        assert!(idle.is_closed());
    }
}
