//! Password login, logout and the session gate in front of every API route.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::handlers::blocking;
use crate::server::AppState;

pub const SESSION_COOKIE: &str = "c00d_session";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub password: String,
}

/// Compare passwords without an early exit on the first differing byte
pub fn password_matches(configured: &str, submitted: &str) -> bool {
    configured.as_bytes().ct_eq(submitted.as_bytes()).into()
}

fn session_token(jar: &CookieJar) -> Option<&str> {
    jar.get(SESSION_COOKIE)
        .map(|cookie| cookie.value())
        .filter(|token| !token.is_empty())
}

/// Admit the request if no password is configured or it carries a live
/// session cookie. Every request pays one session lookup.
pub async fn require_session(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.config.password_required() {
        return Ok(next.run(request).await);
    }

    let token = session_token(&jar).ok_or(ApiError::Unauthorized)?.to_string();
    let sessions = state.sessions.clone();
    if !blocking(move || sessions.validate(&token)).await? {
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

/// `GET /api/auth`
pub async fn status(State(state): State<AppState>, jar: CookieJar) -> Result<Json<Value>, ApiError> {
    if !state.config.password_required() {
        return Ok(Json(json!({ "authenticated": true, "required": false })));
    }
    let Some(token) = session_token(&jar).map(str::to_string) else {
        return Ok(Json(json!({ "authenticated": false, "required": true })));
    };

    let sessions = state.sessions.clone();
    let (valid, expires_at) = blocking(move || {
        if !sessions.validate(&token) {
            return (false, None);
        }
        let expires_at = match sessions.get(&token) {
            Ok(session) => session.map(|s| s.expires_at.to_rfc3339()),
            Err(err) => {
                tracing::warn!("session lookup failed: {:#}", err);
                None
            }
        };
        (true, expires_at)
    })
    .await?;

    if !valid {
        return Ok(Json(json!({ "authenticated": false, "required": true })));
    }
    Ok(Json(json!({ "authenticated": true, "required": true, "expires_at": expires_at })))
}

/// `POST /api/auth`
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<(CookieJar, Json<Value>), ApiError> {
    if !state.config.password_required() {
        // Nothing to log in to; the gate is open
        return Ok((jar, Json(json!({ "success": true, "required": false }))));
    }

    if !password_matches(&state.config.password, &req.password) {
        tracing::info!("rejected login attempt");
        return Err(ApiError::Unauthorized);
    }

    let ttl = state.config.session_ttl();
    let sessions = state.sessions.clone();
    let token = blocking(move || sessions.create(ttl)).await??;
    let max_age = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    let cookie = Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .max_age(cookie::time::Duration::seconds(max_age));

    tracing::info!("session created");
    Ok((jar.add(cookie), Json(json!({ "success": true }))))
}

/// `DELETE /api/auth`
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<Value>), ApiError> {
    if let Some(token) = session_token(&jar).map(str::to_string) {
        let sessions = state.sessions.clone();
        blocking(move || sessions.delete(&token)).await??;
    }

    let cleared = Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .http_only(true)
        .max_age(cookie::time::Duration::seconds(-1));
    Ok((jar.add(cleared), Json(json!({ "success": true }))))
}
