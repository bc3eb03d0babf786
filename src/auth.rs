//! Session authentication for the agent console and token auth for the
//! provider webhook. Sessions are issued elsewhere; this side only
//! validates the JWT carried in the `session` cookie or a bearer header.

use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: Uuid,
    /// Tenant the session is scoped to.
    pub account_id: Uuid,
    pub exp: i64,
    pub iat: i64,
}

/// Authenticated caller, extracted from the session JWT.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub account_id: Uuid,
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| {
            if auth.to_lowercase().starts_with("bearer ") {
                Some(auth[7..].to_string())
            } else {
                None
            }
        })
}

fn extract_session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        if name == "session" {
            Some(value.to_string())
        } else {
            None
        }
    })
}

pub fn decode_session(token: &str, secret: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::Auth)
}

/// Issue a session token. Used by operational tooling and tests; the
/// production issuer lives in the account service.
pub fn issue_session(
    user_id: Uuid,
    account_id: Uuid,
    secret: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id,
        account_id,
        exp: (now + Duration::hours(24)).timestamp(),
        iat: now.timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_session_cookie(&parts.headers)
            .or_else(|| extract_bearer_token(&parts.headers))
            .ok_or(ApiError::Auth)?;
        let claims = decode_session(&token, &state.config.session_secret)?;
        Ok(AuthUser {
            user_id: claims.sub,
            account_id: claims.account_id,
        })
    }
}

/// Webhook auth: when a secret is configured the provider must present it
/// as a bearer token; with no secret configured the endpoint is open.
pub fn verify_webhook_token(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match extract_bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::Auth),
    }
}
