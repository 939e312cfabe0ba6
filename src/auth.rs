//! Identity token validation.
//!
//! A session must never be created from an expired or malformed token, so the
//! guard runs before any call intent or invite is honored. Validation is pure:
//! a token either decodes to a closed [`Identity`] or fails with a typed
//! [`AuthError`], never a partially populated subject.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,

    #[error("token signature invalid")]
    SignatureInvalid,

    #[error("malformed token: {0}")]
    Malformed(String),
}

/// Validated caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub expiry: DateTime<Utc>,
}

impl Identity {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

/// Validates opaque signed tokens into [`Identity`] values.
pub struct AuthGuard {
    key: DecodingKey,
    validation: Validation,
}

impl AuthGuard {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Tokens expire at exactly their exp time.
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::SignatureInvalid,
                _ => AuthError::Malformed(e.to_string()),
            }
        })?;

        let expiry = Utc
            .timestamp_opt(data.claims.exp, 0)
            .single()
            .ok_or_else(|| AuthError::Malformed("exp out of range".to_string()))?;

        Ok(Identity {
            subject: data.claims.sub,
            expiry,
        })
    }
}
