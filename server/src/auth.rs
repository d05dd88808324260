use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AuthError;

/// Identity asserted by a validated client token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    pub mobile_no: String,
    pub device_id: String,
    pub fcm_token: String,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> std::result::Result<TokenIdentity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub mobile_no: String,
    pub device_id: String,
    #[serde(default)]
    pub fcm_token: String,
    pub exp: i64, // Expiration time
    pub iat: i64, // Issued at
}

pub struct JwtTokenValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
}

impl std::fmt::Debug for JwtTokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtTokenValidator")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl JwtTokenValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm: Algorithm::HS256,
        }
    }

    /// Issues a token for tooling and tests; production tokens come from the login service.
    pub fn issue(&self, identity: &TokenIdentity, lifetime: Duration) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            mobile_no: identity.mobile_no.clone(),
            device_id: identity.device_id.clone(),
            fcm_token: identity.fcm_token.clone(),
            exp: now.timestamp() + lifetime.as_secs() as i64,
            iat: now.timestamp(),
        };

        let header = Header::new(self.algorithm);
        encode(&header, &claims, &self.encoding_key).context("Failed to encode JWT token")
    }
}

#[async_trait]
impl TokenValidator for JwtTokenValidator {
    async fn validate(&self, token: &str) -> std::result::Result<TokenIdentity, AuthError> {
        let validation = Validation::new(self.algorithm);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        Ok(TokenIdentity {
            mobile_no: data.claims.mobile_no,
            device_id: data.claims.device_id,
            fcm_token: data.claims.fcm_token,
        })
    }
}
