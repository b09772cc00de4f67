use std::time::Duration;

use async_trait::async_trait;
use axum::http::{self};
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use moka::future::Cache;
use thiserror::Error;
use tracing::info;

/// Who a validated token belongs to.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no JWT secret configured")]
    NotConfigured,
    #[error("JWT validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("can't extract a UID from the JWT token")]
    MissingSubject,
}

/// Token validation seam used by the gateway and the REST middleware.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// HS256 verifier with a short-lived cache so repeated validations of the
/// same token skip the signature check.
pub struct JwtVerifier {
    secret: Option<String>,
    cache: Cache<String, Identity>,
}

impl JwtVerifier {
    pub fn new(secret: Option<String>) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(300))
            .build();
        Self { secret, cache }
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let secret = self.secret.as_ref().ok_or(AuthError::NotConfigured)?;

        if let Some(identity) = self.cache.get(token).await {
            return Ok(identity);
        }

        let token_data = validate_jwt(token, secret)?;
        let uid = token_data
            .claims
            .get("sub")
            .and_then(|v| v.as_str())
            .ok_or(AuthError::MissingSubject)?;
        info!("JWT token validated successfully for user: {}", uid);

        // Get roles from the token claims
        let roles = match token_data.claims.get("roles").and_then(|v| v.as_array()) {
            Some(roles_array) => roles_array
                .iter()
                .filter_map(|r| r.as_str().map(|s| s.to_string()))
                .collect::<Vec<String>>(),
            None => Vec::new(),
        };

        let identity = Identity {
            user_id: uid.to_string(),
            roles,
        };
        self.cache.insert(token.to_string(), identity.clone()).await;
        Ok(identity)
    }
}

// Get the auth token from a request
pub fn get_auth_token<B>(req: &http::Request<B>) -> Result<String, String> {
    // 1. Try to get token from Authorization header
    if let Some(auth_header) = req.headers().get(http::header::AUTHORIZATION) {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| "Invalid Authorization header".to_string())?;
        Ok(auth_str
            .strip_prefix("Bearer ")
            .unwrap_or(auth_str)
            .to_string())
    }
    // 2. Try to get token from cookies
    else {
        let cookie_header = req
            .headers()
            .get(http::header::COOKIE)
            .ok_or_else(|| "Missing Authorization header or Cookie".to_string())?
            .to_str()
            .map_err(|_| "Invalid Cookie header".to_string())?;

        for cookie in cookie::Cookie::split_parse(cookie_header) {
            if let Ok(c) = cookie {
                if c.name() == "auth_token" {
                    return Ok(c.value().to_string());
                }
            }
        }
        Err("auth_token cookie not found".to_string())
    }
}

// Validate a JWT token and return the token data
pub fn validate_jwt(
    token: &str,
    secret: &str,
) -> Result<TokenData<serde_json::Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<serde_json::Value>(token, &decoding_key, &validation)
}
