//! Rate limit guard middleware for axum routers.

use std::sync::Arc;

use axum::extract::{MatchedPath, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use super::rate_limited;
use crate::ratelimit::{AdmissionControl, BucketKey, KeyStrategy};

/// Shared state for [`rate_limit_guard`].
#[derive(Clone)]
pub struct GuardState {
    backend: Arc<dyn AdmissionControl>,
    strategy: KeyStrategy,
}

impl GuardState {
    /// Create guard state over an admission backend.
    pub fn new(backend: Arc<dyn AdmissionControl>, strategy: KeyStrategy) -> Self {
        Self { backend, strategy }
    }
}

/// Client identity from `X-Forwarded-For` (first hop) or `X-Real-IP`.
pub fn client_identity(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|hop| !hop.is_empty()) {
            return Some(first.to_string());
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

/// Reject requests over their bucket's budget with `429`.
///
/// Install with `route_layer` so the matched route template is available;
/// each route then gets its own bucket. A rejected request never reaches the
/// inner handler.
pub async fn rate_limit_guard(State(guard): State<GuardState>, req: Request, next: Next) -> Response {
    let endpoint = match req.extensions().get::<MatchedPath>() {
        Some(path) => path.as_str().to_string(),
        None => req.uri().path().to_string(),
    };
    let client = client_identity(req.headers());
    let key = BucketKey::new(guard.strategy, &endpoint, client.as_deref()).to_string();

    let decision = guard.backend.admit(&key).await;
    if decision.is_admitted() {
        return next.run(req).await;
    }

    debug!(key = %key, decision = ?decision, "Rejecting rate limited request");
    rate_limited(guard.backend.retry_after_secs())
}
