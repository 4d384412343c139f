//! Bearer-token auth for marketplace callers.
//!
//! - Tokens are HS256 JWTs whose `sub` is the user id, valid for `JWT_TTL_DAYS`
//! - The caller's role is always loaded from the store, never from the token
//! - When `DEV_MODE=true`, an `X-User-Id` header is accepted instead of a token

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use super::error::market_error;
use super::routes::AppState;
use crate::marketplace::{Caller, MarketError};

/// Header used to identify the caller in dev mode.
pub const DEV_USER_HEADER: &str = "x-user-id";

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Claims {
    /// Subject: the user id
    sub: String,
    /// Issued-at unix seconds
    iat: i64,
    /// Expiration unix seconds
    exp: i64,
}

/// Issue a token for `user_id`. Returns the token and its expiry.
pub fn issue_jwt(secret: &str, ttl_days: i64, user_id: Uuid) -> anyhow::Result<(String, i64)> {
    let now = Utc::now();
    let exp = now + Duration::days(ttl_days.max(1));
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };
    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, claims.exp))
}

/// Verify a token and return the user id it was issued for.
pub fn verify_jwt(token: &str, secret: &str) -> anyhow::Result<Uuid> {
    let validation = Validation::default();
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(Uuid::parse_str(&token_data.claims.sub)?)
}

fn bearer_token(req: &Request<Body>) -> Option<&str> {
    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())?;
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn dev_user(req: &Request<Body>) -> Option<Uuid> {
    req.headers()
        .get(DEV_USER_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
}

/// Resolve the caller and attach it to the request as an extension.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let user_id = match (state.config.dev_mode, dev_user(&req)) {
        (true, Some(id)) => id,
        _ => {
            // If auth isn't configured, fail closed.
            let secret = match state.config.auth.jwt_secret.as_deref() {
                Some(s) => s,
                None => {
                    return (
                        StatusCode::UNAUTHORIZED,
                        "Missing X-User-Id header or Authorization token",
                    )
                        .into_response();
                }
            };
            let token = match bearer_token(&req) {
                Some(t) => t,
                None => {
                    return (StatusCode::UNAUTHORIZED, "Missing Authorization header").into_response();
                }
            };
            match verify_jwt(token, secret) {
                Ok(id) => id,
                Err(_) => {
                    return (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response();
                }
            }
        }
    };

    let caller = match state.market.resolve_caller(user_id).await {
        Ok(caller) => caller,
        Err(MarketError::NotFound(_)) => {
            return (StatusCode::UNAUTHORIZED, "Unknown user").into_response();
        }
        Err(e) => return market_error(e).into_response(),
    };

    req.extensions_mut().insert(caller);
    next.run(req).await
}

/// Reject callers that cannot verify. Must run inside [`require_auth`].
pub async fn require_admin(req: Request<Body>, next: Next) -> Response {
    match req.extensions().get::<Caller>() {
        Some(caller) if caller.role.can_verify() => next.run(req).await,
        Some(_) => (StatusCode::FORBIDDEN, "Admin access required").into_response(),
        None => (StatusCode::UNAUTHORIZED, "Not authenticated").into_response(),
    }
}
