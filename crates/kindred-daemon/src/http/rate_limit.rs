//! Per-client sliding-window rate limiting.
//!
//! The limiter tracks request timestamps per client IP behind a
//! reader-writer lock. Expired entries are reclaimed by [`sweep`], driven
//! from a single periodic daemon task, with a hard cap on tracked clients
//! bounding memory against address spoofing.
//!
//! [`sweep`]: RateLimiter::sweep

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use super::error::ApiError;
use super::handlers::AppState;

/// Middleware admitting or rejecting a request by client IP.
///
/// # Errors
///
/// Responds 429 when the client exceeded its budget.
pub async fn enforce(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.rate_limiter.allow(addr.ip()) {
        Ok(next.run(request).await)
    } else {
        Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many requests",
            "RATE_LIMITED",
        ))
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per client within the window.
    pub max_requests: u32,

    /// Sliding window length.
    pub window: Duration,

    /// Hard cap on tracked client addresses.
    pub max_tracked_clients: usize,
}

impl RateLimitConfig {
    /// Derives a config from a requests-per-second budget: a one-second
    /// window admitting a 2x burst, matching the upstream gateway contract.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_rps(rps: f64) -> Self {
        let burst = (rps * 2.0).ceil().max(1.0) as u32;
        Self {
            max_requests: burst,
            window: Duration::from_secs(1),
            max_tracked_clients: 10_000,
        }
    }
}

/// Sliding-window limiter keyed by client IP.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: RwLock<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    /// Creates a limiter with the given configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Records a request from `client` and decides whether to admit it.
    ///
    /// Returns `false` when the client exceeded its window budget or when
    /// the tracked-client cap is reached for a new client.
    pub fn allow(&self, client: IpAddr) -> bool {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window).unwrap_or(now);

        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !state.contains_key(&client) && state.len() >= self.config.max_tracked_clients {
            // Reclaim expired entries before rejecting a new client.
            state.retain(|_, stamps| {
                stamps.retain(|&stamp| stamp > cutoff);
                !stamps.is_empty()
            });
            if state.len() >= self.config.max_tracked_clients {
                tracing::warn!(%client, "rejecting new client: tracked-client cap reached");
                return false;
            }
        }

        let stamps = state.entry(client).or_default();
        stamps.retain(|&stamp| stamp > cutoff);

        if stamps.len() >= self.config.max_requests as usize {
            tracing::warn!(
                %client,
                requests = stamps.len(),
                max = self.config.max_requests,
                "rate limit exceeded"
            );
            return false;
        }

        stamps.push(now);
        true
    }

    /// Drops clients with no requests inside the window. Returns how many
    /// entries were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window).unwrap_or(now);

        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = state.len();
        state.retain(|_, stamps| {
            stamps.retain(|&stamp| stamp > cutoff);
            !stamps.is_empty()
        });
        before - state.len()
    }

    /// Number of tracked client addresses.
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
