//! Registry, rooms and dispatcher behaviour across module boundaries.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use fintech_realtime_hub::connection_manager::{ConnectionError, ConnectionRegistry, SessionState};
use fintech_realtime_hub::notification::{
    FailureReason, NotificationDispatcher, OutboundMessage, Target,
};
use fintech_realtime_hub::websocket::OutboundFrame;

fn frame_json(frame: OutboundFrame) -> Value {
    match frame {
        OutboundFrame::Message(msg) => serde_json::to_value(msg).unwrap(),
        OutboundFrame::Encoded(text) => serde_json::from_str(&text).unwrap(),
    }
}

fn setup() -> (Arc<ConnectionRegistry>, NotificationDispatcher) {
    let registry = Arc::new(ConnectionRegistry::new());
    let dispatcher =
        NotificationDispatcher::with_send_timeout(registry.clone(), Duration::from_millis(100));
    (registry, dispatcher)
}

#[tokio::test]
async fn test_unregister_leaves_no_dangling_references() {
    let (registry, _) = setup();
    let mut handles = Vec::new();
    for i in 0..4 {
        let (tx, _rx) = mpsc::channel(4);
        let handle = registry.connect(format!("user-{}", i % 2), tx).unwrap();
        registry.join(handle.id, "market_data").unwrap();
        registry.join(handle.id, "fx").unwrap();
        handles.push(handle);
    }

    let gone = handles[1].id;
    assert!(registry.unregister(gone));

    assert!(!registry.connections_for_user("user-1").contains(&gone));
    assert!(!registry.members_of("market_data").contains(&gone));
    assert!(!registry.members_of("fx").contains(&gone));
    assert!(!registry.all_connections().contains(&gone));
    assert!(registry.rooms_of(gone).is_empty());
    assert_eq!(handles[1].state(), SessionState::Closed);

    // A closed connection cannot come back or join anything
    let err = assert_err!(registry.join(gone, "market_data"));
    assert_eq!(err, ConnectionError::NotFound(gone));
    assert_err!(registry.register(handles[1].clone()));
}

#[tokio::test]
async fn test_join_then_leave_is_immediately_visible() {
    let (registry, _) = setup();
    let (tx, _rx) = mpsc::channel(4);
    let handle = registry.connect("user-1", tx).unwrap();

    assert!(assert_ok!(registry.join(handle.id, "market_data")));
    assert!(registry.members_of("market_data").contains(&handle.id));

    assert!(registry.leave(handle.id, "market_data"));
    assert!(!registry.members_of("market_data").contains(&handle.id));
    assert!(registry.list_rooms().is_empty());
}

#[tokio::test]
async fn test_unregister_twice_is_a_noop() {
    let (registry, _) = setup();
    let (tx, _rx) = mpsc::channel(4);
    let handle = registry.connect("user-1", tx).unwrap();
    registry.join(handle.id, "market_data").unwrap();

    assert!(registry.unregister(handle.id));
    let after_first = (registry.stats().total_connections, registry.total_memberships());

    assert!(!registry.unregister(handle.id));
    let after_second = (registry.stats().total_connections, registry.total_memberships());

    assert_eq!(after_first, after_second);
    assert_eq!(after_second, (0, 0));
}

#[tokio::test]
async fn test_send_to_user_reaches_all_live_connections() {
    let (registry, dispatcher) = setup();
    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (tx, rx) = mpsc::channel(4);
        registry.connect("user-1", tx).unwrap();
        receivers.push(rx);
    }

    let report = dispatcher
        .send_to_user("user-1", &OutboundMessage::balance_update("user-1", json!({"balance": "1200.50"})))
        .await;

    assert_eq!(report.attempted, 3);
    assert_eq!(report.delivered, 3);
    assert!(report.failures.is_empty());

    for rx in receivers.iter_mut() {
        let msg = frame_json(rx.recv().await.unwrap());
        assert_eq!(msg["type"], "balance_update");
        assert_eq!(msg["data"]["balance"], "1200.50");
    }
}

#[tokio::test]
async fn test_send_to_user_survives_one_failed_connection() {
    let (registry, dispatcher) = setup();
    let (tx1, mut rx1) = mpsc::channel(4);
    let (tx2, rx2) = mpsc::channel(4);
    let (tx3, mut rx3) = mpsc::channel(4);
    registry.connect("user-1", tx1).unwrap();
    let dead = registry.connect("user-1", tx2).unwrap();
    registry.connect("user-1", tx3).unwrap();
    drop(rx2);

    let report = dispatcher
        .dispatch(OutboundMessage::transaction_update("user-1", json!({"id": "tx-1"})))
        .await;

    assert_eq!(report.delivered, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].connection_id, dead.id);
    assert_eq!(report.failures[0].reason, FailureReason::Closed);

    assert!(!registry.contains(dead.id));
    assert_eq!(registry.user_connection_count("user-1"), 2);
    assert!(rx1.recv().await.is_some());
    assert!(rx3.recv().await.is_some());
}

#[tokio::test]
async fn test_slow_connection_times_out_without_blocking_others() {
    let (registry, dispatcher) = setup();
    let (tx_slow, _rx_slow) = mpsc::channel(1);
    let (tx_fast, mut rx_fast) = mpsc::channel(4);
    let slow = registry.connect("user-1", tx_slow).unwrap();
    registry.connect("user-2", tx_fast).unwrap();

    // Fill the slow connection's buffer
    slow.send_frame(OutboundFrame::Encoded(Arc::from("{}"))).await.unwrap();

    let report = dispatcher
        .broadcast_all(&OutboundMessage::system_announcement(json!({"message": "maintenance"})))
        .await;

    assert_eq!(report.attempted, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failures[0].reason, FailureReason::TimedOut);
    assert!(slow.is_closed());
    assert!(rx_fast.recv().await.is_some());
}

#[tokio::test]
async fn test_broadcast_and_room_scenario() {
    let (registry, dispatcher) = setup();
    let (tx1, mut rx1) = mpsc::channel(4);
    let (tx2, mut rx2) = mpsc::channel(4);
    let c1 = registry.connect("user-u", tx1).unwrap();
    let _c2 = registry.connect("user-u", tx2).unwrap();
    registry.join(c1.id, "market_data").unwrap();

    let report = dispatcher
        .broadcast_all(&OutboundMessage::system_announcement(json!({"message": "hello"})))
        .await;
    assert_eq!(report.delivered, 2);
    assert_eq!(frame_json(rx1.recv().await.unwrap())["type"], "system_announcement");
    assert_eq!(frame_json(rx2.recv().await.unwrap())["type"], "system_announcement");

    let report = dispatcher
        .dispatch(OutboundMessage::market_update(None, json!({"symbol": "BTCUSD", "price": "64000"})))
        .await;
    assert_eq!(report.target, Target::Room("market_data".into()));
    assert_eq!(report.delivered, 1);
    assert_eq!(frame_json(rx1.recv().await.unwrap())["data"]["symbol"], "BTCUSD");
    assert!(rx2.try_recv().is_err());
}

#[tokio::test]
async fn test_large_fanout_uses_shared_frame() {
    let (registry, dispatcher) = setup();
    let mut receivers = Vec::new();
    for i in 0..8 {
        let (tx, rx) = mpsc::channel(4);
        let handle = registry.connect(format!("user-{}", i), tx).unwrap();
        registry.join(handle.id, "quotes").unwrap();
        receivers.push(rx);
    }

    let report = dispatcher
        .send_to_room("quotes", &OutboundMessage::market_update(Some("quotes".into()), json!({"bid": 1})))
        .await;
    assert_eq!(report.delivered, 8);

    for rx in receivers.iter_mut() {
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, OutboundFrame::Encoded(_)));
        assert_eq!(frame_json(frame)["type"], "market_update");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_join_and_leave_same_room() {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut ids = Vec::new();
    let mut receivers = Vec::new();
    for i in 0..100 {
        let (tx, rx) = mpsc::channel(1);
        ids.push(registry.connect(format!("user-{}", i), tx).unwrap().id);
        receivers.push(rx);
    }

    let joins: Vec<_> = ids
        .iter()
        .map(|&id| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.join(id, "market_data") })
        })
        .collect();
    for join in joins {
        assert!(assert_ok!(join.await.unwrap()));
    }
    assert_eq!(registry.members_of("market_data").len(), 100);

    let leaves: Vec<_> = ids
        .iter()
        .map(|&id| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.leave(id, "market_data") })
        })
        .collect();
    for leave in leaves {
        assert!(leave.await.unwrap());
    }

    assert!(registry.members_of("market_data").is_empty());
    assert!(registry.room_info("market_data").is_none());
    assert_eq!(registry.total_memberships(), 0);
    assert_eq!(registry.connection_count(), 100);
    for id in &ids {
        assert!(registry.rooms_of(*id).is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_join_and_unregister_never_dangles() {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut handles = Vec::new();
    let mut receivers = Vec::new();
    for i in 0..100 {
        let (tx, rx) = mpsc::channel(1);
        handles.push(registry.connect(format!("user-{}", i), tx).unwrap());
        receivers.push(rx);
    }

    let tasks: Vec<_> = handles
        .iter()
        .flat_map(|handle| {
            let id = handle.id;
            let joiner = registry.clone();
            let closer = registry.clone();
            [
                tokio::spawn(async move {
                    let _ = joiner.join(id, "market_data");
                }),
                tokio::spawn(async move {
                    closer.unregister(id);
                }),
            ]
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(registry.connection_count(), 0);
    assert!(registry.members_of("market_data").is_empty());
    assert_eq!(registry.total_memberships(), 0);
}

#[tokio::test]
async fn test_connection_limits() {
    use fintech_realtime_hub::connection_manager::ConnectionLimits;

    let registry = ConnectionRegistry::with_limits(ConnectionLimits {
        max_connections: 3,
        max_connections_per_user: 2,
        max_rooms_per_connection: 50,
    });
    let mut receivers = Vec::new();
    let mut connect = |user: &str| {
        let (tx, rx) = mpsc::channel(1);
        receivers.push(rx);
        registry.connect(user, tx)
    };

    assert_ok!(connect("user-1"));
    assert_ok!(connect("user-1"));
    assert!(matches!(
        connect("user-1"),
        Err(ConnectionError::UserLimitExceeded { .. })
    ));
    assert_ok!(connect("user-2"));
    assert!(matches!(
        connect("user-3"),
        Err(ConnectionError::TotalLimitExceeded { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registrations_respect_limits() {
    use fintech_realtime_hub::connection_manager::ConnectionLimits;

    let registry = Arc::new(ConnectionRegistry::with_limits(ConnectionLimits {
        max_connections: 8,
        max_connections_per_user: 3,
        max_rooms_per_connection: 50,
    }));

    let register_all = |users: Vec<String>| {
        let tasks: Vec<_> = users
            .into_iter()
            .map(|user| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let (tx, rx) = mpsc::channel(1);
                    (registry.connect(user, tx).is_ok(), rx)
                })
            })
            .collect();
        async move {
            let mut admitted = 0;
            let mut receivers = Vec::new();
            for task in tasks {
                let (ok, rx) = task.await.unwrap();
                admitted += ok as usize;
                receivers.push(rx);
            }
            (admitted, receivers)
        }
    };

    let (admitted, _same_user) = register_all(vec!["user-1".to_string(); 64]).await;
    assert_eq!(admitted, 3);
    assert_eq!(registry.user_connection_count("user-1"), 3);

    let others = (0..64).map(|i| format!("user-{}", i + 2)).collect();
    let (admitted, _others) = register_all(others).await;
    assert_eq!(admitted, 5);
    assert_eq!(registry.connection_count(), 8);
}
