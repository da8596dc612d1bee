//! Operator bearer token verification

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Claims carried by operator tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Operator name
    pub sub: String,

    /// Expiry, seconds since the epoch
    pub exp: u64,
}

/// HS256 verifier; without a signing secret every token is rejected
pub struct TokenVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: Option<&SecretString>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: secret.map(|s| DecodingKey::from_secret(s.expose_secret().as_bytes())),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, DeployError> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| DeployError::AuthError("token verification is not configured".to_string()))?;
        decode::<Claims>(token.trim(), key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| DeployError::AuthError(format!("invalid token: {}", e)))
    }

    /// Verify the `Authorization: Bearer <token>` header
    pub fn verify_headers(&self, headers: &HeaderMap) -> Result<Claims, DeployError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
            .ok_or_else(|| DeployError::AuthError("missing bearer token".to_string()))?;
        self.verify(token)
    }
}
