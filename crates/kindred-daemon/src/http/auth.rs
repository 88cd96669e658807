//! Bearer-secret authentication for the API surface.
//!
//! Requests must carry `Authorization: Bearer <secret>` matching the
//! configured API secret. The comparison is constant-time; only the length
//! check can leak, and secret length is not sensitive here.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use super::error::ApiError;
use super::handlers::AppState;

/// Middleware enforcing the bearer secret on API routes.
///
/// # Errors
///
/// Responds 401 when the header is missing, malformed, or mismatched.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Authorization header required"))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("Invalid authorization header format"))?;

    let secret = state.api_secret.as_bytes();
    let token = token.as_bytes();
    if secret.len() != token.len() || secret.ct_eq(token).unwrap_u8() != 1 {
        return Err(ApiError::unauthorized("Invalid credentials"));
    }

    Ok(next.run(request).await)
}
