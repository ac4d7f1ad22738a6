use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::websocket::ServerMessage;

/// Room that market updates go to unless told otherwise
pub const MARKET_DATA_ROOM: &str = "market_data";

/// Kinds of events other subsystems can publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Notification,
    TransactionUpdate,
    BalanceUpdate,
    MarketUpdate,
    SystemAnnouncement,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::TransactionUpdate => "transaction_update",
            Self::BalanceUpdate => "balance_update",
            Self::MarketUpdate => "market_update",
            Self::SystemAnnouncement => "system_announcement",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a message goes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Target {
    /// Every live connection of one user
    User(String),
    /// Every member of a room
    Room(String),
    /// Every registered connection
    Broadcast,
}

impl Target {
    pub fn label(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Room(_) => "room",
            Self::Broadcast => "broadcast",
        }
    }
}

/// An event plus its destination. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    id: Uuid,
    kind: EventKind,
    payload: Value,
    target: Target,
    created_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(kind: EventKind, payload: Value, target: Target) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            target,
            created_at: Utc::now(),
        }
    }

    /// A general notification to one user, or to everyone when `user_id` is None
    pub fn notification(payload: Value, user_id: Option<String>) -> Self {
        let target = match user_id {
            Some(user_id) => Target::User(user_id),
            None => Target::Broadcast,
        };
        Self::new(EventKind::Notification, payload, target)
    }

    pub fn transaction_update(user_id: impl Into<String>, payload: Value) -> Self {
        Self::new(EventKind::TransactionUpdate, payload, Target::User(user_id.into()))
    }

    pub fn balance_update(user_id: impl Into<String>, payload: Value) -> Self {
        Self::new(EventKind::BalanceUpdate, payload, Target::User(user_id.into()))
    }

    pub fn market_update(room: Option<String>, payload: Value) -> Self {
        let room = room.unwrap_or_else(|| MARKET_DATA_ROOM.to_string());
        Self::new(EventKind::MarketUpdate, payload, Target::Room(room))
    }

    pub fn system_announcement(payload: Value) -> Self {
        Self::new(EventKind::SystemAnnouncement, payload, Target::Broadcast)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Wire envelope for this message
    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage {
            kind: self.kind.into(),
            data: self.payload.clone(),
            timestamp: self.created_at,
        }
    }
}

/// Why a single connection did not get a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The connection's outbound channel is gone
    Closed,
    /// The connection did not accept the message within the send timeout
    TimedOut,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Per-connection delivery failure. The connection has been unregistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryFailure {
    pub connection_id: Uuid,
    pub user_id: String,
    pub reason: FailureReason,
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub message_id: Uuid,
    pub target: Target,
    /// Connections the message was handed to
    pub attempted: usize,
    pub delivered: usize,
    pub failures: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    pub(crate) fn empty(message_id: Uuid, target: Target) -> Self {
        Self {
            message_id,
            target,
            attempted: 0,
            delivered: 0,
            failures: Vec::new(),
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// True when at least one connection got the message
    pub fn success(&self) -> bool {
        self.delivered > 0
    }
}
