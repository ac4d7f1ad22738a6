//! Outbound message model and fan-out.
//!
//! Other subsystems build an [`OutboundMessage`] (kind, payload, target) and
//! hand it to the [`NotificationDispatcher`], which returns a
//! [`DeliveryReport`] listing the connections that could not be reached.

mod dispatcher;
mod types;

pub use dispatcher::{
    send_direct, DispatcherStatsSnapshot, NotificationDispatcher, DEFAULT_SEND_TIMEOUT,
};
pub use types::{
    DeliveryFailure, DeliveryReport, EventKind, FailureReason, OutboundMessage, Target,
    MARKET_DATA_ROOM,
};
