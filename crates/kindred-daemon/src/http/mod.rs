//! HTTP surface: routing, authentication, rate limiting, error envelope.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod rate_limit;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

pub use handlers::AppState;

/// Builds the service router.
///
/// `/health` and `/metrics` are open; everything under `/api/v1` passes
/// the rate limiter and then the bearer-secret check.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/compute", post(handlers::compute))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::enforce,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1", api)
        .with_state(state)
}
