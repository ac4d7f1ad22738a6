//! Connection statistics and info structures

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub unique_users: usize,
    pub rooms: HashMap<String, usize>,
}

/// Room information
#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub name: String,
    pub member_count: usize,
}

/// Details of one live connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub rooms: Vec<String>,
}

/// All live connections of one user
#[derive(Debug, Clone, Serialize)]
pub struct UserConnectionInfo {
    pub user_id: String,
    pub connection_count: usize,
    pub connections: Vec<ConnectionInfo>,
}
