//! API layer - HTTP endpoint handlers organized by domain.

mod connection;
mod health;
mod metrics;
mod routes;

pub use connection::{get_room, get_user_connections, list_rooms};
pub use health::{health, stats};
pub use metrics::prometheus_metrics;
pub use routes::{api_routes, trigger_routes};
