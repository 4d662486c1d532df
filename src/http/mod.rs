//! HTTP surface: the rate limit guard middleware and the decision API.

mod guard;
mod server;
mod service;

pub use guard::{client_identity, rate_limit_guard, GuardState};
pub use server::HttpServer;
pub use service::{router, AppState, BucketStatus, RateLimitRequest, RateLimitResponse};

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Message returned with every `429` response.
pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";

/// JSON body for error responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Build an error response with a JSON `{"error": ...}` body.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// The `429 Too Many Requests` response for a rejected request.
pub fn rate_limited(retry_after_secs: u64) -> Response {
    let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_EXCEEDED);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, header::HeaderValue::from(retry_after_secs));
    response
}
