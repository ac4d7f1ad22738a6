//! Room membership index
//!
//! Many-to-many mapping between connections and named rooms, kept in both
//! directions so a disconnect can purge every membership without scanning
//! all rooms.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Default)]
pub struct RoomIndex {
    /// room_name -> Set<connection_id>
    rooms: DashMap<String, HashSet<Uuid>>,
    /// connection_id -> Set<room_name>
    memberships: DashMap<Uuid, HashSet<String>>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, creating the room if needed.
    /// Returns true if the connection was not already a member.
    pub fn join(&self, connection_id: Uuid, room: &str) -> bool {
        // Hold the reverse entry while touching the room so both sides change together
        let mut joined = self.memberships.entry(connection_id).or_default();
        let added = joined.insert(room.to_string());

        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id);

        drop(joined);
        added
    }

    /// Remove a connection from a room. Removing a non-member is a no-op.
    pub fn leave(&self, connection_id: Uuid, room: &str) -> bool {
        let removed = match self.memberships.get_mut(&connection_id) {
            Some(mut joined) => {
                let removed = joined.remove(room);
                if let Some(mut members) = self.rooms.get_mut(room) {
                    members.remove(&connection_id);
                }
                self.rooms.remove_if(room, |_, members| members.is_empty());
                removed
            }
            None => false,
        };

        self.memberships
            .remove_if(&connection_id, |_, rooms| rooms.is_empty());

        removed
    }

    /// Members of a room; empty if the room does not exist.
    pub fn members_of(&self, room: &str) -> HashSet<Uuid> {
        self.rooms
            .get(room)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    /// Rooms a connection currently belongs to.
    pub fn rooms_of(&self, connection_id: Uuid) -> HashSet<String> {
        self.memberships
            .get(&connection_id)
            .map(|rooms| rooms.clone())
            .unwrap_or_default()
    }

    pub fn room_count_for(&self, connection_id: Uuid) -> usize {
        self.memberships
            .get(&connection_id)
            .map(|rooms| rooms.len())
            .unwrap_or(0)
    }

    pub fn is_member(&self, connection_id: Uuid, room: &str) -> bool {
        self.memberships
            .get(&connection_id)
            .map(|rooms| rooms.contains(room))
            .unwrap_or(false)
    }

    /// Drop a connection from every room it belongs to.
    /// Returns the number of rooms it was removed from.
    pub fn remove_connection_everywhere(&self, connection_id: Uuid) -> usize {
        let removed = match self.memberships.get_mut(&connection_id) {
            Some(mut joined) => {
                let rooms = std::mem::take(&mut *joined);
                for room in &rooms {
                    if let Some(mut members) = self.rooms.get_mut(room) {
                        members.remove(&connection_id);
                    }
                    self.rooms.remove_if(room, |_, members| members.is_empty());
                }
                rooms.len()
            }
            None => return 0,
        };

        self.memberships
            .remove_if(&connection_id, |_, rooms| rooms.is_empty());

        removed
    }

    /// room_name -> member count
    pub fn snapshot(&self) -> HashMap<String, usize> {
        self.rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_memberships(&self) -> usize {
        self.memberships.iter().map(|entry| entry.value().len()).sum()
    }
}
