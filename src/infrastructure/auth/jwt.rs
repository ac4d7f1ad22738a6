use std::str::FromStr;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::config::JwtConfig;
use crate::error::AppError;

use super::{AuthFailure, Claims, Principal, SessionAuthenticator};

/// HMAC JWT verifier used for the WebSocket handshake
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(config: &JwtConfig) -> Result<Self, AppError> {
        let algorithm = Algorithm::from_str(&config.algorithm).map_err(|_| {
            AppError::Validation(format!("Unsupported JWT algorithm: {}", config.algorithm))
        })?;
        if !matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(AppError::Validation(format!(
                "JWT algorithm {} needs a key pair; only HS256/HS384/HS512 are supported",
                config.algorithm
            )));
        }

        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        let mut validation = Validation::new(algorithm);

        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }

        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AuthFailure> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AuthFailure::InvalidToken(e.to_string()))?;

        Ok(token_data.claims)
    }
}

#[async_trait]
impl SessionAuthenticator for JwtValidator {
    async fn verify(&self, credential: &str) -> Result<Principal, AuthFailure> {
        let claims = self.validate(credential)?;
        if claims.sub.trim().is_empty() {
            return Err(AuthFailure::MissingSubject);
        }

        Ok(Principal {
            user_id: claims.sub,
            email: claims.email,
            username: claims.username,
            role: claims.role,
        })
    }
}
