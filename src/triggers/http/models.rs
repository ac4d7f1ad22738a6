use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::notification::{DeliveryFailure, DeliveryReport, EventKind, Target};

#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RoomQuery {
    pub room: Option<String>,
}

/// Body of `POST /api/v1/dispatch`
#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default = "empty_object")]
    pub data: Value,
    pub target: Target,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Delivery report summary returned by every publish endpoint
#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub success: bool,
    pub message_id: Uuid,
    pub message_type: EventKind,
    pub target: Target,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<DeliveryFailure>,
    pub timestamp: DateTime<Utc>,
}

impl DispatchResponse {
    pub fn from_report(kind: EventKind, report: DeliveryReport) -> Self {
        Self {
            success: report.success(),
            message_id: report.message_id,
            message_type: kind,
            attempted: report.attempted,
            delivered: report.delivered,
            failed: report.failed(),
            target: report.target,
            failures: report.failures,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_request_parses_all_targets() {
        let req: DispatchRequest = serde_json::from_value(json!({
            "type": "market_update",
            "data": {"symbol": "EURUSD", "bid": 1.0841},
            "target": {"type": "room", "value": "fx"}
        }))
        .unwrap();
        assert_eq!(req.kind, EventKind::MarketUpdate);
        assert_eq!(req.target, Target::Room("fx".into()));

        let req: DispatchRequest = serde_json::from_value(json!({
            "type": "system_announcement",
            "target": {"type": "broadcast"}
        }))
        .unwrap();
        assert_eq!(req.target, Target::Broadcast);
        assert_eq!(req.data, json!({}));
    }

    #[test]
    fn test_dispatch_request_rejects_unknown_kind() {
        let result: Result<DispatchRequest, _> = serde_json::from_value(json!({
            "type": "price_alert",
            "target": {"type": "broadcast"}
        }));
        assert!(result.is_err());
    }
}
