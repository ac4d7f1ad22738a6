use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::notification::EventKind;

/// Control messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    JoinRoom { room: String },
    LeaveRoom { room: String },
    SubscribeNotifications {
        #[serde(default)]
        types: Vec<String>,
    },
}

const KNOWN_CLIENT_TYPES: &[&str] = &["ping", "join_room", "leave_room", "subscribe_notifications"];

/// Inbound text that could not be turned into a [`ClientMessage`]
#[derive(Debug, Error)]
pub enum ControlMessageError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("Message must be a JSON object with a string \"type\" field")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: String,
        source: serde_json::Error,
    },
}

impl ClientMessage {
    /// Parse a text frame. Unknown types are rejected rather than dropped.
    pub fn parse(text: &str) -> Result<Self, ControlMessageError> {
        let value: Value = serde_json::from_str(text).map_err(ControlMessageError::InvalidJson)?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ControlMessageError::MissingType)?
            .to_string();

        if !KNOWN_CLIENT_TYPES.contains(&kind.as_str()) {
            return Err(ControlMessageError::UnknownType(kind));
        }

        serde_json::from_value(value)
            .map_err(|source| ControlMessageError::InvalidPayload { kind, source })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::SubscribeNotifications { .. } => "subscribe_notifications",
        }
    }
}

/// `type` tag of every envelope the server sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ConnectionEstablished,
    Pong,
    RoomJoined,
    RoomLeft,
    SubscriptionUpdated,
    Heartbeat,
    Notification,
    TransactionUpdate,
    BalanceUpdate,
    MarketUpdate,
    SystemAnnouncement,
    Error,
}

impl From<EventKind> for MessageType {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Notification => Self::Notification,
            EventKind::TransactionUpdate => Self::TransactionUpdate,
            EventKind::BalanceUpdate => Self::BalanceUpdate,
            EventKind::MarketUpdate => Self::MarketUpdate,
            EventKind::SystemAnnouncement => Self::SystemAnnouncement,
            EventKind::Error => Self::Error,
        }
    }
}

/// Outbound envelope: `{type, data, timestamp}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl ServerMessage {
    pub fn new(kind: MessageType, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn connection_established(connection_id: Uuid, user_id: &str) -> Self {
        Self::new(
            MessageType::ConnectionEstablished,
            json!({
                "connection_id": connection_id,
                "user_id": user_id,
                "message": "Connected to real-time notifications",
            }),
        )
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong, json!({}))
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, json!({}))
    }

    pub fn room_joined(room: &str) -> Self {
        Self::new(MessageType::RoomJoined, json!({ "room": room }))
    }

    pub fn room_left(room: &str) -> Self {
        Self::new(MessageType::RoomLeft, json!({ "room": room }))
    }

    pub fn subscription_updated(subscriptions: Vec<String>) -> Self {
        Self::new(
            MessageType::SubscriptionUpdated,
            json!({ "subscriptions": subscriptions }),
        )
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            json!({ "code": code.into(), "message": message.into() }),
        )
    }
}

/// Item on a connection's outbound channel.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Serialized by the socket writer
    Message(ServerMessage),
    /// Encoded once and shared across a fan-out
    Encoded(Arc<str>),
}

impl OutboundFrame {
    pub fn preserialized(message: &ServerMessage) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(message)?;
        Ok(Self::Encoded(Arc::from(json)))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Message(message) => serde_json::to_string(message),
            Self::Encoded(json) => Ok(json.to_string()),
        }
    }
}
