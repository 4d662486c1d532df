//! Rate limit decision API.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn, Span};

use super::{error_response, rate_limited};
use crate::ratelimit::{AdmissionControl, BucketKey, KeyStrategy, LeakyBucketLimiter};

/// Shared state for the decision API handlers.
#[derive(Clone)]
pub struct AppState {
    /// Admission backend, immediate or queued
    backend: Arc<dyn AdmissionControl>,
    /// The limiter behind the backend, for read-only inspection
    limiter: Arc<LeakyBucketLimiter>,
    /// How endpoint and client are combined into a bucket key
    strategy: KeyStrategy,
}

impl AppState {
    /// Create handler state.
    pub fn new(
        backend: Arc<dyn AdmissionControl>,
        limiter: Arc<LeakyBucketLimiter>,
        strategy: KeyStrategy,
    ) -> Self {
        Self {
            backend,
            limiter,
            strategy,
        }
    }

    /// Bucket key for a request, or `None` if the endpoint is blank.
    fn key_for(&self, request: &RateLimitRequest) -> Option<String> {
        let endpoint = request.endpoint.trim();
        if endpoint.is_empty() {
            return None;
        }
        Some(BucketKey::new(self.strategy, endpoint, request.client.as_deref()).to_string())
    }
}

/// Body of a rate limit decision request, also used as the query of a
/// bucket lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRequest {
    /// Endpoint or resource being guarded
    pub endpoint: String,
    /// Caller identity; only used with the per-client key strategy
    #[serde(default)]
    pub client: Option<String>,
}

/// Body of an admitted decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitResponse {
    pub allowed: bool,
}

/// Current state of one bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketStatus {
    pub key: String,
    pub level: f64,
    pub capacity: f64,
    pub leak_rate: f64,
}

/// Build the decision API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/ratelimit", post(should_rate_limit))
        .route("/v1/buckets", get(bucket_status))
        .with_state(state)
}

/// Decide whether one request for the given endpoint may proceed.
///
/// A body that is not a valid request is answered with the usual JSON
/// error shape rather than axum's plain-text rejection.
#[instrument(skip_all, fields(endpoint = tracing::field::Empty))]
async fn should_rate_limit(
    State(state): State<AppState>,
    payload: Result<Json<RateLimitRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Received malformed rate limit request");
            return error_response(rejection.status(), &rejection.body_text());
        }
    };
    Span::current().record("endpoint", request.endpoint.as_str());

    let Some(key) = state.key_for(&request) else {
        warn!("Received rate limit request with empty endpoint");
        return error_response(StatusCode::BAD_REQUEST, "endpoint is required");
    };

    let decision = state.backend.admit(&key).await;
    info!(key = %key, decision = ?decision, "Rate limit decision made");

    if decision.is_admitted() {
        (StatusCode::OK, Json(RateLimitResponse { allowed: true })).into_response()
    } else {
        rate_limited(state.backend.retry_after_secs())
    }
}

/// Report the current level of a bucket without touching it.
#[instrument(skip_all, fields(endpoint = %request.endpoint))]
async fn bucket_status(
    State(state): State<AppState>,
    Query(request): Query<RateLimitRequest>,
) -> Response {
    let Some(key) = state.key_for(&request) else {
        return error_response(StatusCode::BAD_REQUEST, "endpoint is required");
    };

    match state.limiter.level(&key) {
        Some(level) => {
            let policy = state.limiter.policy();
            Json(BucketStatus {
                key,
                level,
                capacity: policy.capacity(),
                leak_rate: policy.leak_rate(),
            })
            .into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "unknown bucket"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ErrorBody;
    use crate::ratelimit::{BucketPolicy, QueuedLimiter};
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::header;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(capacity: f64, strategy: KeyStrategy) -> Router {
        // slow enough that nothing leaks during a test
        let policy = BucketPolicy::new(capacity, 0.001).unwrap();
        let limiter = Arc::new(LeakyBucketLimiter::new(policy));
        router(AppState::new(limiter.clone(), limiter, strategy))
    }

    fn decision_request(body: &str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/v1/ratelimit")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn status_request(query: &str) -> Request {
        axum::http::Request::builder()
            .uri(format!("/v1/buckets?{}", query))
            .body(Body::empty())
            .unwrap()
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_admitted_request_returns_ok() {
        let app = app(2.0, KeyStrategy::Endpoint);

        let response = app.oneshot(decision_request(r#"{"endpoint": "upload"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: RateLimitResponse = json(response).await;
        assert!(body.allowed);
    }

    #[tokio::test]
    async fn test_exhausted_endpoint_returns_429() {
        let app = app(1.0, KeyStrategy::Endpoint);

        let response = app.clone().oneshot(decision_request(r#"{"endpoint": "upload"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(decision_request(r#"{"endpoint": "upload"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1000");
        let body: ErrorBody = json(response).await;
        assert_eq!(body.error, "Rate limit exceeded");

        // another endpoint is unaffected
        let response = app.oneshot(decision_request(r#"{"endpoint": "tags"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_empty_endpoint_rejected() {
        let app = app(1.0, KeyStrategy::Endpoint);

        let response = app.oneshot(decision_request(r#"{"endpoint": "  "}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = json(response).await;
        assert_eq!(body.error, "endpoint is required");
    }

    #[tokio::test]
    async fn test_malformed_body_returns_json_error() {
        let app = app(1.0, KeyStrategy::Endpoint);

        let response = app.clone().oneshot(decision_request(r#"{"client": "alice"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let body: ErrorBody = json(response).await;
        assert!(body.error.contains("endpoint"), "unexpected error: {}", body.error);

        let response = app.oneshot(decision_request("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = json(response).await;
        assert!(!body.error.is_empty());
    }

    #[tokio::test]
    async fn test_separator_in_client_does_not_share_buckets() {
        let app = app(1.0, KeyStrategy::EndpointAndClient);

        let first = r#"{"endpoint": "upload", "client": "10.0.0.1|x"}"#;
        let second = r#"{"endpoint": "upload|10.0.0.1", "client": "x"}"#;
        let response = app.clone().oneshot(decision_request(first)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(decision_request(second)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_client_is_ignored_by_endpoint_strategy() {
        let app = app(1.0, KeyStrategy::Endpoint);

        let first = r#"{"endpoint": "query", "client": "alice"}"#;
        let second = r#"{"endpoint": "query", "client": "bob"}"#;
        let response = app.clone().oneshot(decision_request(first)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(decision_request(second)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_client_strategy_partitions_by_client() {
        let app = app(1.0, KeyStrategy::EndpointAndClient);

        let first = r#"{"endpoint": "query", "client": "alice"}"#;
        let second = r#"{"endpoint": "query", "client": "bob"}"#;
        let response = app.clone().oneshot(decision_request(first)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(decision_request(second)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bucket_status() {
        let app = app(4.0, KeyStrategy::EndpointAndClient);

        let response = app.clone().oneshot(status_request("endpoint=upload&client=alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = r#"{"endpoint": "upload", "client": "alice"}"#;
        app.clone().oneshot(decision_request(body)).await.unwrap();

        let response = app.oneshot(status_request("endpoint=upload&client=alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status: BucketStatus = json(response).await;
        assert_eq!(status.key, "upload|alice");
        assert!(status.level > 0.99 && status.level <= 1.0);
        assert_eq!(status.capacity, 4.0);
        assert_eq!(status.leak_rate, 0.001);
    }

    #[tokio::test]
    async fn test_queued_backend_times_out_with_429() {
        let policy = BucketPolicy::new(1.0, 0.001).unwrap();
        let limiter = Arc::new(LeakyBucketLimiter::new(policy));
        let queued = Arc::new(QueuedLimiter::new(limiter.clone(), 4, Duration::from_millis(20)));
        let app = router(AppState::new(queued, limiter, KeyStrategy::Endpoint));

        let response = app.clone().oneshot(decision_request(r#"{"endpoint": "upload"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(decision_request(r#"{"endpoint": "upload"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
