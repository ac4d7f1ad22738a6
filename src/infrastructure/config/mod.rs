mod settings;

pub use settings::{ApiConfig, JwtConfig, OtelConfig, ServerConfig, Settings, WebSocketConfig};
