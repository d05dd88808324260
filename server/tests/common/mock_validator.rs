use arena_server::auth::{TokenIdentity, TokenValidator};
use arena_server::error::AuthError;
use async_trait::async_trait;
use std::collections::HashMap;

/// Token validator backed by a fixed token table
pub struct MockTokenValidator {
    tokens: HashMap<String, TokenIdentity>,
}

impl MockTokenValidator {
    pub fn new() -> Self {
        Self {
            tokens: HashMap::new(),
        }
    }

    pub fn with_token(mut self, token: &str, mobile_no: &str, device_id: &str) -> Self {
        self.tokens.insert(
            token.to_string(),
            TokenIdentity {
                mobile_no: mobile_no.to_string(),
                device_id: device_id.to_string(),
                fcm_token: format!("fcm-{}", device_id),
            },
        );
        self
    }
}

#[async_trait]
impl TokenValidator for MockTokenValidator {
    async fn validate(&self, token: &str) -> Result<TokenIdentity, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("unknown token".to_string()))
    }
}
