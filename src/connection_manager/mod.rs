//! Connection management for WebSocket connections
//!
//! This module provides:
//! - Connection handles and their lifecycle state
//! - The connection registry (user index, liveness, limits)
//! - The room membership index
//! - Connection statistics

mod registry;
mod rooms;
mod stats;
mod types;

pub use registry::ConnectionRegistry;
pub use rooms::RoomIndex;
pub use stats::{ConnectionInfo, ConnectionStats, RoomInfo, UserConnectionInfo};
pub use types::{ConnectionError, ConnectionHandle, ConnectionLimits, SessionState};
