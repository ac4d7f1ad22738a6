use std::sync::Arc;
use std::time::Instant;

use crate::auth::{JwtValidator, SessionAuthenticator};
use crate::config::Settings;
use crate::connection_manager::ConnectionRegistry;
use crate::error::Result;
use crate::notification::NotificationDispatcher;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub authenticator: Arc<dyn SessionAuthenticator>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the shared state with JWT session authentication
    pub fn new(settings: Settings) -> Result<Self> {
        let authenticator = Arc::new(JwtValidator::new(&settings.jwt)?);
        Ok(Self::with_authenticator(settings, authenticator))
    }

    pub fn with_authenticator(
        settings: Settings,
        authenticator: Arc<dyn SessionAuthenticator>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::with_limits(settings.websocket.limits()));
        let dispatcher = Arc::new(NotificationDispatcher::with_send_timeout(
            registry.clone(),
            settings.websocket.send_timeout(),
        ));

        Self {
            settings: Arc::new(settings),
            authenticator,
            registry,
            dispatcher,
            start_time: Instant::now(),
        }
    }
}
