//! HTTP publish endpoints
//!
//! - Typed broadcasts (`/broadcast/{notification,transaction,balance,market,announcement}`)
//! - Fully specified dispatch (`/dispatch`)

mod handlers;
mod models;

pub use handlers::{
    broadcast_announcement, broadcast_balance, broadcast_market, broadcast_notification,
    broadcast_transaction, dispatch_message,
};
pub use models::{DispatchRequest, DispatchResponse, RoomQuery, UserQuery};
