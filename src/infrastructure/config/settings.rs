use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Heartbeat interval in seconds (server sends heartbeat envelope)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Connection timeout in seconds (disconnect if no activity)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Cleanup task interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Time one connection gets to accept a message, in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Per-connection outbound buffer
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    #[serde(default = "default_max_rooms_per_connection")]
    pub max_rooms_per_connection: usize,
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_connection_timeout() -> u64 {
    120
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_send_timeout_ms() -> u64 {
    2000
}

fn default_channel_buffer_size() -> usize {
    32
}

fn default_max_connections() -> usize {
    10000
}

fn default_max_connections_per_user() -> usize {
    5
}

fn default_max_rooms_per_connection() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Required `X-API-Key` for admin broadcast endpoints; open when unset
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "fintech-realtime-hub".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("jwt.algorithm", default_algorithm())?
            .set_default("websocket.heartbeat_interval", default_heartbeat_interval())?
            .set_default("websocket.connection_timeout", default_connection_timeout())?
            .set_default("websocket.cleanup_interval", default_cleanup_interval())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // JWT_SECRET, SERVER_PORT, API_KEY, OTEL_ENABLED; multi-word keys belong in config files
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl WebSocketConfig {
    pub fn send_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.send_timeout_ms)
    }

    pub fn limits(&self) -> crate::connection_manager::ConnectionLimits {
        crate::connection_manager::ConnectionLimits {
            max_connections: self.max_connections,
            max_connections_per_user: self.max_connections_per_user,
            max_rooms_per_connection: self.max_rooms_per_connection,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
            json_logs: false,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            connection_timeout: default_connection_timeout(),
            cleanup_interval: default_cleanup_interval(),
            send_timeout_ms: default_send_timeout_ms(),
            channel_buffer_size: default_channel_buffer_size(),
            max_connections: default_max_connections(),
            max_connections_per_user: default_max_connections_per_user(),
            max_rooms_per_connection: default_max_rooms_per_connection(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8000);

        let ws = WebSocketConfig::default();
        assert_eq!(ws.heartbeat_interval, 30);
        assert_eq!(ws.connection_timeout, 120);
        assert_eq!(ws.send_timeout(), std::time::Duration::from_secs(2));
        assert_eq!(ws.limits().max_connections_per_user, 5);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let settings: Settings = Config::builder()
            .set_override("jwt.secret", "s3cret")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.jwt.algorithm, "HS256");
        assert!(settings.api.key.is_none());
        assert!(!settings.otel.enabled);
        assert_eq!(settings.websocket.max_rooms_per_connection, 50);
        assert_eq!(settings.server_addr(), "0.0.0.0:8000");
    }
}
