use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::websocket::OutboundFrame;

use super::rooms::RoomIndex;
use super::stats::{ConnectionInfo, ConnectionStats, RoomInfo, UserConnectionInfo};
use super::types::{ConnectionError, ConnectionHandle, ConnectionLimits};

/// Tracks all live connections, their owners, and room memberships.
///
/// Lock order is always connection shard first, then user/room shards.
/// Reads copy id sets out and release the shard before resolving handles.
pub struct ConnectionRegistry {
    /// connection_id -> ConnectionHandle
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
    /// user_id -> Set<connection_id> (supports multiple devices)
    user_index: DashMap<String, HashSet<Uuid>>,
    rooms: RoomIndex,
    limits: ConnectionLimits,
    /// Registered connections plus in-flight registrations
    active: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_limits(ConnectionLimits::default())
    }

    pub fn with_limits(limits: ConnectionLimits) -> Self {
        Self {
            connections: DashMap::new(),
            user_index: DashMap::new(),
            rooms: RoomIndex::new(),
            limits,
            active: AtomicUsize::new(0),
        }
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    /// Register an authenticated connection and mark it established.
    ///
    /// Both limits are enforced under a lock: the total through an atomic slot
    /// reservation, the per-user count while holding that user's index entry.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Result<Uuid, ConnectionError> {
        let conn_id = handle.id;

        if handle.is_closed() {
            return Err(ConnectionError::Closed(conn_id));
        }

        let Entry::Vacant(slot) = self.connections.entry(conn_id) else {
            return Err(ConnectionError::Duplicate(conn_id));
        };

        let max = self.limits.max_connections;
        if let Err(current) = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
        {
            return Err(ConnectionError::TotalLimitExceeded { current, max });
        }

        let admitted = {
            let mut user_conns = self.user_index.entry(handle.user_id.clone()).or_default();
            let user_current = user_conns.len();
            if user_current >= self.limits.max_connections_per_user {
                Err(ConnectionError::UserLimitExceeded {
                    user_id: handle.user_id.clone(),
                    current: user_current,
                    max: self.limits.max_connections_per_user,
                })
            } else if !handle.mark_established() {
                Err(ConnectionError::Closed(conn_id))
            } else {
                user_conns.insert(conn_id);
                Ok(())
            }
        };

        if let Err(e) = admitted {
            self.active.fetch_sub(1, Ordering::AcqRel);
            self.user_index
                .remove_if(&handle.user_id, |_, conns| conns.is_empty());
            return Err(e);
        }

        slot.insert(handle.clone());

        tracing::info!(connection_id = %conn_id, user_id = %handle.user_id, "Connection registered");

        Ok(conn_id)
    }

    /// Build a handle for `user_id` and register it.
    pub fn connect(
        &self,
        user_id: impl Into<String>,
        sender: mpsc::Sender<OutboundFrame>,
    ) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        let handle = Arc::new(ConnectionHandle::new(user_id, sender));
        self.register(handle.clone())?;
        Ok(handle)
    }

    /// Remove a connection, its user index entry, and every room membership.
    ///
    /// Idempotent: returns false if the connection was already gone.
    pub fn unregister(&self, connection_id: Uuid) -> bool {
        let Some((_, handle)) = self.connections.remove(&connection_id) else {
            return false;
        };
        self.active.fetch_sub(1, Ordering::AcqRel);

        if let Some(mut user_conns) = self.user_index.get_mut(&handle.user_id) {
            user_conns.remove(&connection_id);
        }
        self.user_index
            .remove_if(&handle.user_id, |_, conns| conns.is_empty());

        let rooms_left = self.rooms.remove_connection_everywhere(connection_id);

        handle.mark_closed();

        tracing::info!(
            connection_id = %connection_id,
            user_id = %handle.user_id,
            rooms_left = rooms_left,
            "Connection unregistered"
        );

        true
    }

    /// Add a live connection to a room.
    /// Returns Ok(false) if it was already a member.
    pub fn join(&self, connection_id: Uuid, room: &str) -> Result<bool, ConnectionError> {
        // Holding the entry keeps unregister from removing it mid-join
        let Some(_live) = self.connections.get(&connection_id) else {
            return Err(ConnectionError::NotFound(connection_id));
        };

        if !self.rooms.is_member(connection_id, room) {
            let current = self.rooms.room_count_for(connection_id);
            if current >= self.limits.max_rooms_per_connection {
                return Err(ConnectionError::RoomLimitExceeded {
                    current,
                    max: self.limits.max_rooms_per_connection,
                });
            }
        }

        let added = self.rooms.join(connection_id, room);
        if added {
            tracing::debug!(connection_id = %connection_id, room = %room, "Joined room");
        }
        Ok(added)
    }

    /// Remove a connection from a room; a no-op for non-members.
    pub fn leave(&self, connection_id: Uuid, room: &str) -> bool {
        let removed = self.rooms.leave(connection_id, room);
        if removed {
            tracing::debug!(connection_id = %connection_id, room = %room, "Left room");
        }
        removed
    }

    /// Live members of a room; empty if the room does not exist.
    pub fn members_of(&self, room: &str) -> HashSet<Uuid> {
        self.rooms
            .members_of(room)
            .into_iter()
            .filter(|id| self.connections.contains_key(id))
            .collect()
    }

    pub fn rooms_of(&self, connection_id: Uuid) -> HashSet<String> {
        self.rooms.rooms_of(connection_id)
    }

    /// Live connection ids of a user; empty if none.
    pub fn connections_for_user(&self, user_id: &str) -> HashSet<Uuid> {
        self.user_ids(user_id)
            .into_iter()
            .filter(|id| self.connections.contains_key(id))
            .collect()
    }

    /// Snapshot of every registered connection id
    pub fn all_connections(&self) -> Vec<Uuid> {
        self.connections.iter().map(|r| *r.key()).collect()
    }

    pub fn contains(&self, connection_id: Uuid) -> bool {
        self.connections.contains_key(&connection_id)
    }

    /// Handles for every connection of a user
    pub fn user_handles(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.resolve(self.user_ids(user_id))
    }

    /// Handles for every member of a room
    pub fn room_handles(&self, room: &str) -> Vec<Arc<ConnectionHandle>> {
        self.resolve(self.rooms.members_of(room))
    }

    /// Handles for every connection
    pub fn all_handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.user_index
            .get(user_id)
            .map(|conns| conns.len())
            .unwrap_or(0)
    }

    pub fn total_memberships(&self) -> usize {
        self.rooms.total_memberships()
    }

    /// Get statistics
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            total_connections: self.connections.len(),
            unique_users: self.user_index.len(),
            rooms: self.rooms.snapshot(),
        }
    }

    /// All rooms with their member counts, sorted by name
    pub fn list_rooms(&self) -> Vec<RoomInfo> {
        let mut rooms: Vec<RoomInfo> = self
            .rooms
            .snapshot()
            .into_iter()
            .map(|(name, member_count)| RoomInfo { name, member_count })
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    pub fn room_info(&self, room: &str) -> Option<RoomInfo> {
        let members = self.members_of(room);
        if members.is_empty() {
            return None;
        }
        Some(RoomInfo {
            name: room.to_string(),
            member_count: members.len(),
        })
    }

    pub fn user_info(&self, user_id: &str) -> Option<UserConnectionInfo> {
        let handles = self.user_handles(user_id);
        if handles.is_empty() {
            return None;
        }

        let mut connections: Vec<ConnectionInfo> = handles
            .iter()
            .map(|h| {
                let mut rooms: Vec<String> = self.rooms.rooms_of(h.id).into_iter().collect();
                rooms.sort();
                ConnectionInfo {
                    connection_id: h.id,
                    connected_at: h.connected_at,
                    last_activity: h.last_activity(),
                    rooms,
                }
            })
            .collect();
        connections.sort_by_key(|c| c.connected_at);

        Some(UserConnectionInfo {
            user_id: user_id.to_string(),
            connection_count: connections.len(),
            connections,
        })
    }

    /// Find connections that have been inactive for longer than the timeout
    pub fn find_stale_connections(&self, timeout_secs: u64) -> Vec<Uuid> {
        let now = chrono::Utc::now();
        let timeout = chrono::Duration::seconds(timeout_secs as i64);

        self.connections
            .iter()
            .filter(|entry| now.signed_duration_since(entry.value().last_activity()) > timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Remove stale connections and return how many were removed
    pub fn cleanup_stale_connections(&self, timeout_secs: u64) -> usize {
        let stale = self.find_stale_connections(timeout_secs);
        let mut removed = 0;

        for conn_id in stale {
            tracing::info!(connection_id = %conn_id, "Removing stale connection due to timeout");
            if self.unregister(conn_id) {
                removed += 1;
            }
        }

        removed
    }

    fn user_ids(&self, user_id: &str) -> HashSet<Uuid> {
        self.user_index
            .get(user_id)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    fn resolve(&self, ids: HashSet<Uuid>) -> Vec<Arc<ConnectionHandle>> {
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|h| h.clone()))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::SessionState;

    fn channel() -> (mpsc::Sender<OutboundFrame>, mpsc::Receiver<OutboundFrame>) {
        mpsc::channel(8)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let handle = registry.connect("user-1", tx).unwrap();

        assert_eq!(handle.state(), SessionState::Established);
        assert!(registry.connections_for_user("user-1").contains(&handle.id));
        assert_eq!(registry.all_connections(), vec![handle.id]);
        assert!(registry.connections_for_user("nobody").is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let handle = Arc::new(ConnectionHandle::new("user-1", tx));

        assert_eq!(registry.register(handle.clone()), Ok(handle.id));
        assert_eq!(
            registry.register(handle.clone()),
            Err(ConnectionError::Duplicate(handle.id))
        );
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_closed_handle_is_not_resurrected() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let handle = registry.connect("user-1", tx).unwrap();

        assert!(registry.unregister(handle.id));
        assert_eq!(
            registry.register(handle.clone()),
            Err(ConnectionError::Closed(handle.id))
        );
        assert!(!registry.contains(handle.id));
    }

    #[test]
    fn test_multiple_devices_per_user() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let c1 = registry.connect("user-1", tx1).unwrap();
        let c2 = registry.connect("user-1", tx2).unwrap();

        let ids = registry.connections_for_user("user-1");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&c1.id) && ids.contains(&c2.id));
        assert_eq!(registry.stats().unique_users, 1);
    }

    #[test]
    fn test_unregister_is_idempotent_and_cleans_rooms() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let handle = registry.connect("user-1", tx).unwrap();
        registry.join(handle.id, "market_data").unwrap();
        registry.join(handle.id, "alerts").unwrap();

        assert!(registry.unregister(handle.id));
        assert!(!registry.unregister(handle.id));

        assert!(handle.is_closed());
        assert!(registry.connections_for_user("user-1").is_empty());
        assert!(registry.members_of("market_data").is_empty());
        assert!(registry.members_of("alerts").is_empty());
        assert!(registry.stats().rooms.is_empty());
        assert_eq!(registry.stats().unique_users, 0);
    }

    #[test]
    fn test_join_unknown_connection_fails() {
        let registry = ConnectionRegistry::new();
        let ghost = Uuid::new_v4();

        assert_eq!(
            registry.join(ghost, "market_data"),
            Err(ConnectionError::NotFound(ghost))
        );
        assert!(registry.members_of("market_data").is_empty());
    }

    #[test]
    fn test_join_then_leave() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let handle = registry.connect("user-1", tx).unwrap();

        assert_eq!(registry.join(handle.id, "market_data"), Ok(true));
        assert_eq!(registry.join(handle.id, "market_data"), Ok(false));
        assert!(registry.members_of("market_data").contains(&handle.id));

        assert!(registry.leave(handle.id, "market_data"));
        assert!(!registry.leave(handle.id, "market_data"));
        assert!(!registry.members_of("market_data").contains(&handle.id));
    }

    #[test]
    fn test_user_limit() {
        let registry = ConnectionRegistry::with_limits(ConnectionLimits {
            max_connections: 100,
            max_connections_per_user: 2,
            max_rooms_per_connection: 10,
        });

        let (tx, _rx) = channel();
        registry.connect("user-1", tx.clone()).unwrap();
        registry.connect("user-1", tx.clone()).unwrap();

        let err = registry.connect("user-1", tx.clone()).unwrap_err();
        assert!(matches!(err, ConnectionError::UserLimitExceeded { max: 2, .. }));

        // Other users are unaffected
        assert!(registry.connect("user-2", tx).is_ok());
    }

    #[test]
    fn test_total_limit() {
        let registry = ConnectionRegistry::with_limits(ConnectionLimits {
            max_connections: 1,
            max_connections_per_user: 5,
            max_rooms_per_connection: 10,
        });

        let (tx, _rx) = channel();
        registry.connect("user-1", tx.clone()).unwrap();
        let err = registry.connect("user-2", tx).unwrap_err();
        assert_eq!(err, ConnectionError::TotalLimitExceeded { current: 1, max: 1 });
    }

    #[test]
    fn test_rejected_registration_releases_total_slot() {
        let registry = ConnectionRegistry::with_limits(ConnectionLimits {
            max_connections: 2,
            max_connections_per_user: 1,
            max_rooms_per_connection: 10,
        });

        let (tx, _rx) = channel();
        let first = registry.connect("user-1", tx.clone()).unwrap();
        assert!(registry.connect("user-1", tx.clone()).is_err());
        assert!(registry.user_info("user-1").is_some());

        let second = registry.connect("user-2", tx.clone()).unwrap();
        assert!(registry.connect("user-3", tx.clone()).is_err());

        registry.unregister(first.id);
        registry.unregister(second.id);
        assert!(registry.connect("user-3", tx).is_ok());
        assert_eq!(registry.stats().unique_users, 1);
    }

    #[test]
    fn test_room_limit() {
        let registry = ConnectionRegistry::with_limits(ConnectionLimits {
            max_connections: 10,
            max_connections_per_user: 5,
            max_rooms_per_connection: 2,
        });

        let (tx, _rx) = channel();
        let handle = registry.connect("user-1", tx).unwrap();
        registry.join(handle.id, "a").unwrap();
        registry.join(handle.id, "b").unwrap();

        // Re-joining an existing room does not count against the limit
        assert_eq!(registry.join(handle.id, "a"), Ok(false));
        assert!(matches!(
            registry.join(handle.id, "c"),
            Err(ConnectionError::RoomLimitExceeded { current: 2, max: 2 })
        ));
    }

    #[test]
    fn test_stale_connection_cleanup() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let stale = registry.connect("user-1", tx.clone()).unwrap();
        let fresh = registry.connect("user-2", tx).unwrap();

        stale.set_last_activity(chrono::Utc::now() - chrono::Duration::seconds(600));

        assert_eq!(registry.find_stale_connections(120), vec![stale.id]);
        assert_eq!(registry.cleanup_stale_connections(120), 1);
        assert!(stale.is_closed());
        assert!(registry.contains(fresh.id));
        assert!(!registry.contains(stale.id));
    }

    #[test]
    fn test_user_info_and_rooms() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let handle = registry.connect("user-1", tx).unwrap();
        registry.join(handle.id, "b").unwrap();
        registry.join(handle.id, "a").unwrap();

        let info = registry.user_info("user-1").unwrap();
        assert_eq!(info.connection_count, 1);
        assert_eq!(info.connections[0].rooms, vec!["a".to_string(), "b".to_string()]);
        assert!(registry.user_info("user-2").is_none());

        let rooms = registry.list_rooms();
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].name, "a");
        assert_eq!(registry.room_info("a").map(|r| r.member_count), Some(1));
        assert!(registry.room_info("missing").is_none());
    }
}
