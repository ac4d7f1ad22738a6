//! Handshake credential verification boundary.
//!
//! The hub only needs "credential in, user out". Token parsing and
//! cryptography live behind [`SessionAuthenticator`].

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Identity of an authenticated client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub user_id: String,
    pub email: Option<String>,
    pub username: Option<String>,
    pub role: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            username: None,
            role: super::DEFAULT_ROLE.to_string(),
        }
    }
}

/// Handshake rejection. No connection is ever created for these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("Authentication token required")]
    MissingToken,

    #[error("Invalid or expired token: {0}")]
    InvalidToken(String),

    #[error("Invalid token: missing user ID")]
    MissingSubject,
}

#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Principal, AuthFailure>;
}

/// Verify an optional credential. Runs before any connection exists.
pub async fn authenticate(
    authenticator: &dyn SessionAuthenticator,
    credential: Option<&str>,
) -> Result<Principal, AuthFailure> {
    let credential = credential
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or(AuthFailure::MissingToken)?;

    authenticator.verify(credential).await
}
