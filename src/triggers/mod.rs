mod http;

pub use http::{
    broadcast_announcement, broadcast_balance, broadcast_market, broadcast_notification,
    broadcast_transaction, dispatch_message, DispatchRequest, DispatchResponse, RoomQuery,
    UserQuery,
};
