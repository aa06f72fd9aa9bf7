//! Rate limiting middleware for axum.

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::key::KeySource;
use crate::ratelimit::{Decision, RateLimiter};

/// Shared state for the rate limiting middleware.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    /// The rate limiter instance
    limiter: Arc<RateLimiter>,
    /// How client keys are extracted in per-client mode
    key_source: KeySource,
}

impl RateLimitState {
    /// Create middleware state around a shared limiter.
    pub fn new(limiter: Arc<RateLimiter>, key_source: KeySource) -> Self {
        Self {
            limiter,
            key_source,
        }
    }

    /// The limiter backing this middleware.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

/// Apply rate limiting to every route of `router`.
///
/// Routes added after this call are not limited.
pub fn limit<S>(router: Router<S>, state: RateLimitState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(state, rate_limit))
}

/// Admit the request or answer for it.
///
/// Denied requests get `429 Too Many Requests` with a `Retry-After` header.
/// A client that cannot be identified in per-client mode gets `500`, never
/// a 429, so throttling and identification failures stay distinguishable.
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    req: Request,
    next: Next,
) -> Response {
    let client_key = if state.limiter.scope().is_keyed() {
        match state.key_source.extract(&req) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "Could not identify client");
                return internal_error();
            }
        }
    } else {
        None
    };

    match state.limiter.decide(client_key.as_deref()) {
        Ok(Decision::Admitted) => next.run(req).await,
        Ok(Decision::Denied { retry_after }) => {
            debug!(
                client = client_key.as_deref().unwrap_or("*"),
                retry_after_ms = retry_after.as_millis() as u64,
                "Rejecting request over rate limit"
            );
            too_many_requests(retry_after)
        }
        Err(e) => {
            warn!(error = %e, "Rate limit check failed");
            internal_error()
        }
    }
}

fn too_many_requests(retry_after: Duration) -> Response {
    let millis = retry_after.as_nanos().div_ceil(1_000_000) as u64;
    let seconds = millis.div_ceil(1_000).max(1);

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        format!(
            "Rate limit exceeded. Try again in {:?}",
            Duration::from_millis(millis)
        ),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
    response
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}
