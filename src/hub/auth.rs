//! Bearer token authentication for the control API

use super::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::debug;

/// Paths reachable without a token
const PUBLIC_PATHS: &[&str] = &["/", "/version", "/health"];

/// Authentication middleware
///
/// A configured secret must be presented as `Authorization: Bearer <secret>`.
/// Comparison is constant-time.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.secret.is_empty() {
        return Ok(next.run(req).await);
    }

    let path = req.uri().path();
    if PUBLIC_PATHS.contains(&path) {
        return Ok(next.run(req).await);
    }

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if constant_time_eq(token.as_bytes(), state.secret.as_bytes()) => {
            Ok(next.run(req).await)
        }
        _ => {
            debug!("Rejected unauthenticated request to {}", path);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
