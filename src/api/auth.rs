//! Bearer-token authentication
//!
//! The hub verifies HS256 tokens minted elsewhere; issuing tokens is not
//! its business. WebSocket handshakes carry the token in the query string
//! (`/ws?token=...`), HTTP requests in the `Authorization: Bearer` header.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

use super::responses::ApiError;
use crate::app::AppState;
use crate::gateway::Principal;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

/// Claims the hub requires of a token.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    /// Principal id
    sub: String,
    /// Display name; falls back to the principal id when absent
    name: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// Verifies bearer tokens against a shared HS256 secret.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify a token and extract the principal it asserts.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)?;
        let display_name = data
            .claims
            .name
            .unwrap_or_else(|| data.claims.sub.clone());

        Ok(Principal {
            principal_id: data.claims.sub,
            display_name,
        })
    }
}

/// Bearer token from an `Authorization` header, if present.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Authentication middleware for the HTTP surface. The verified
/// [`Principal`] lands in request extensions for handlers to read.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())
        .ok_or_else(|| ApiError::unauthorized("Missing or invalid Authorization header"))?;

    let principal = state
        .verifier
        .verify(&token)
        .map_err(|e| ApiError::unauthorized(format!("Invalid token: {}", e)))?;

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}
