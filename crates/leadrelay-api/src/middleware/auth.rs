//! Bearer token authentication for admin routes.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::AppState;

/// Extracts the token from `Authorization: Bearer <token>`.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Compares without short-circuiting on the first differing byte.
fn tokens_match(expected: &str, provided: &str) -> bool {
    let (expected, provided) = (expected.as_bytes(), provided.as_bytes());
    if expected.len() != provided.len() {
        return false;
    }
    expected.iter().zip(provided).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

/// Errors that can occur during token authentication.
#[derive(Debug)]
pub enum AuthError {
    /// The Authorization header is missing or not a bearer token.
    MissingHeader,
    /// The provided token does not match.
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            Self::MissingHeader => "Missing Authorization header",
            Self::InvalidToken => "Invalid admin token",
        };

        (StatusCode::UNAUTHORIZED, message).into_response()
    }
}

/// Rejects requests without the configured admin token.
///
/// Passes everything through when no token is configured.
pub async fn require_admin_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    if let Some(expected) = state.admin_token.as_deref() {
        let provided = extract_bearer_token(req.headers()).ok_or(AuthError::MissingHeader)?;
        if !tokens_match(expected, provided) {
            warn!(path = %req.uri().path(), "rejected admin request with invalid token");
            return Err(AuthError::InvalidToken);
        }
    }

    Ok(next.run(req).await)
}
