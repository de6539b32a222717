//! Bearer-token guard for the internal surface
//!
//! The bot front-end and operator tooling share `INTERNAL_API_TOKEN`.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::{error::ApiError, state::AppState};

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Middleware that requires the internal bearer token
pub async fn require_internal_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let expected = state.config.internal_api_token.as_bytes();
    let authorized = extract_bearer_token(&request)
        .map(|token| bool::from(token.as_bytes().ct_eq(expected)))
        .unwrap_or(false);

    if !authorized {
        tracing::warn!(path = %request.uri().path(), "Rejected internal request without valid token");
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}
