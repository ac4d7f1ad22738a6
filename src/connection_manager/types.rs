//! Connection handle and related types

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::websocket::{OutboundFrame, ServerMessage};

/// Lifecycle of a single client connection.
///
/// `Connecting -> Established -> Closed`. `Closed` is terminal; a client that
/// reconnects gets a brand new handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Established = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Established,
            _ => Self::Closed,
        }
    }
}

/// Handle for a single WebSocket connection
pub struct ConnectionHandle {
    pub id: Uuid,
    pub user_id: String,
    pub sender: mpsc::Sender<OutboundFrame>,
    pub connected_at: DateTime<Utc>,
    /// Last activity timestamp (Unix seconds)
    last_activity: AtomicI64,
    state: AtomicU8,
    closed: Notify,
    /// Notification types the client asked for. Advisory only.
    pub subscriptions: RwLock<HashSet<String>>,
}

impl ConnectionHandle {
    pub fn new(user_id: impl Into<String>, sender: mpsc::Sender<OutboundFrame>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            sender,
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            state: AtomicU8::new(SessionState::Connecting as u8),
            closed: Notify::new(),
            subscriptions: RwLock::new(HashSet::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Move `Connecting -> Established`. Returns false if the handle was
    /// already established or closed.
    pub(crate) fn mark_established(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Established as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Closed` and wake the session waiting in [`Self::wait_closed`].
    /// Only the first caller gets `true`.
    pub(crate) fn mark_closed(&self) -> bool {
        let previous = self
            .state
            .swap(SessionState::Closed as u8, Ordering::AcqRel);
        if previous == SessionState::Closed as u8 {
            return false;
        }
        // notify_one stores a permit, so a session that starts waiting later still wakes
        self.closed.notify_one();
        true
    }

    /// Resolves once the handle has been closed by any path.
    pub async fn wait_closed(&self) {
        if self.is_closed() {
            return;
        }
        self.closed.notified().await;
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: DateTime<Utc>) {
        self.last_activity.store(at.timestamp(), Ordering::Relaxed);
    }

    /// Send a ServerMessage (serialized by the socket writer)
    pub async fn send(
        &self,
        message: ServerMessage,
    ) -> Result<(), mpsc::error::SendError<OutboundFrame>> {
        self.sender.send(OutboundFrame::Message(message)).await
    }

    /// Send an already built frame (shared pre-encoded fan-out payloads)
    pub async fn send_frame(
        &self,
        frame: OutboundFrame,
    ) -> Result<(), mpsc::error::SendError<OutboundFrame>> {
        self.sender.send(frame).await
    }

    /// Replace the advisory notification-type filter.
    pub async fn set_subscriptions(&self, types: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut subs = self.subscriptions.write().await;
        subs.clear();
        subs.extend(types);
        let mut current: Vec<String> = subs.iter().cloned().collect();
        current.sort();
        current
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        let mut current: Vec<String> = self.subscriptions.read().await.iter().cloned().collect();
        current.sort();
        current
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Structural errors from the registry. These are surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Connection {0} is already registered")]
    Duplicate(Uuid),

    #[error("Connection {0} is closed and cannot be registered again")]
    Closed(Uuid),

    #[error("Connection {0} not found")]
    NotFound(Uuid),

    #[error("Total connection limit exceeded ({current}/{max})")]
    TotalLimitExceeded { current: usize, max: usize },

    #[error("User {user_id} connection limit exceeded ({current}/{max})")]
    UserLimitExceeded {
        user_id: String,
        current: usize,
        max: usize,
    },

    #[error("Room limit exceeded ({current}/{max})")]
    RoomLimitExceeded { current: usize, max: usize },
}

impl ConnectionError {
    /// Short machine-readable code used in `error` envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Duplicate(_) => "DUPLICATE_CONNECTION",
            Self::Closed(_) => "CONNECTION_CLOSED",
            Self::NotFound(_) => "CONNECTION_NOT_FOUND",
            Self::TotalLimitExceeded { .. } | Self::UserLimitExceeded { .. } => "CONNECTION_LIMIT",
            Self::RoomLimitExceeded { .. } => "ROOM_LIMIT",
        }
    }
}

/// Limits for connection management
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_connections_per_user: usize,
    pub max_rooms_per_connection: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 10000,
            max_connections_per_user: 5,
            max_rooms_per_connection: 50,
        }
    }
}
