//! Airtable quota middleware.
//!
//! # Responsibilities
//! - Enforce the per-credential global limit for requests carrying `x-api-key`
//! - Enforce the per-base limit for `/bases/{base_id}/...` paths
//! - Report both budgets on successful responses
//!
//! # Design Decisions
//! - Requests without an API key pass through untouched
//! - Response headers reuse the pre-request decisions, so a request is
//!   counted once per scope

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::ResilienceError;
use crate::http::middleware::rate_limit::API_KEY_HEADER;
use crate::rate_limit::{hash_api_key, AirtableRateLimiter, RateLimitDecision, StoreError};

pub struct AirtableLimitState {
    limiter: AirtableRateLimiter,
    exclude_paths: Vec<String>,
    fail_open: bool,
}

impl AirtableLimitState {
    pub fn new(limiter: AirtableRateLimiter) -> Self {
        Self {
            limiter,
            exclude_paths: vec!["/health".to_string(), "/metrics".to_string()],
            fail_open: true,
        }
    }

    pub fn with_exclude_paths(mut self, paths: Vec<String>) -> Self {
        self.exclude_paths = paths;
        self
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }
}

/// Base id from a `/bases/{base_id}/...` path.
pub fn extract_base_id(path: &str) -> Option<&str> {
    let mut segments = path.trim_matches('/').split('/');
    match (segments.next(), segments.next()) {
        (Some("bases"), Some(base_id)) if !base_id.is_empty() => Some(base_id),
        _ => None,
    }
}

fn limit_response(decision: &RateLimitDecision, scope: &str) -> Response {
    tracing::warn!(
        limit_type = %scope,
        limit = decision.limit,
        retry_after = decision.retry_after,
        "Airtable rate limit exceeded"
    );

    let body = json!({
        "error": format!("Rate limit exceeded for {}", scope),
        "error_code": "RATE_LIMIT",
        "retry_after": decision.retry_after,
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    decision.apply_headers(response.headers_mut());
    response
}

fn insert_budget(headers: &mut HeaderMap, scope: &'static str, decision: &RateLimitDecision) {
    let (limit, remaining) = match scope {
        "base" => ("x-ratelimit-base-limit", "x-ratelimit-base-remaining"),
        _ => ("x-ratelimit-global-limit", "x-ratelimit-global-remaining"),
    };
    headers.insert(limit, HeaderValue::from(decision.limit));
    headers.insert(remaining, HeaderValue::from(decision.remaining));
}

/// Global then base checks. `Ok(Err(response))` is a rejection.
async fn check_limits(
    limiter: &AirtableRateLimiter,
    api_key: &str,
    base_id: Option<&str>,
) -> Result<Result<(RateLimitDecision, Option<RateLimitDecision>), Response>, StoreError> {
    let global = limiter.check_global_limit(&hash_api_key(api_key)).await?;
    if !global.allowed {
        return Ok(Err(limit_response(&global, "global")));
    }

    let base = match base_id {
        Some(base_id) => {
            let decision = limiter.check_base_limit(base_id).await?;
            if !decision.allowed {
                return Ok(Err(limit_response(&decision, &format!("base:{}", base_id))));
            }
            Some(decision)
        }
        None => None,
    };

    Ok(Ok((global, base)))
}

pub async fn airtable_rate_limit_middleware(
    State(state): State<Arc<AirtableLimitState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if state.exclude_paths.iter().any(|p| *p == path) {
        return next.run(request).await;
    }

    let api_key = match request.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(key) => key.to_string(),
        None => return next.run(request).await,
    };

    match check_limits(&state.limiter, &api_key, extract_base_id(&path)).await {
        Ok(Ok((global, base))) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            insert_budget(headers, "global", &global);
            if let Some(base) = &base {
                insert_budget(headers, "base", base);
            }
            response
        }
        Ok(Err(rejection)) => rejection,
        Err(err) if state.fail_open => {
            tracing::warn!(error = %err, path = %path, "Airtable rate limit store unavailable; allowing request");
            next.run(request).await
        }
        Err(err) => ResilienceError::StoreUnavailable(err).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use crate::rate_limit::{ManualClock, MemoryStore};

    fn app() -> Router {
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let state = Arc::new(AirtableLimitState::new(AirtableRateLimiter::with_clock(store, clock)));

        Router::new()
            .route("/bases/{base_id}/records", get(|| async { "records" }))
            .route("/whoami", get(|| async { "me" }))
            .layer(axum::middleware::from_fn_with_state(state, airtable_rate_limit_middleware))
    }

    fn request(path: &str, api_key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(key) = api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extract_base_id() {
        assert_eq!(extract_base_id("/bases/appABC/records"), Some("appABC"));
        assert_eq!(extract_base_id("bases/appABC"), Some("appABC"));
        assert_eq!(extract_base_id("/bases/"), None);
        assert_eq!(extract_base_id("/tables/appABC"), None);
    }

    #[tokio::test]
    async fn test_base_limit_rejects_sixth_request() {
        let app = app();

        for expected_remaining in (0..5).rev() {
            let response = app.clone().oneshot(request("/bases/appA/records", Some("key"))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers()["x-ratelimit-base-remaining"],
                expected_remaining.to_string().as_str()
            );
            assert_eq!(response.headers()["x-ratelimit-global-limit"], "100");
        }

        let rejected = app.clone().oneshot(request("/bases/appA/records", Some("key"))).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejected.headers()[header::RETRY_AFTER], "1");

        // A different base still has budget
        let other = app.clone().oneshot(request("/bases/appB/records", Some("key"))).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_requests_without_api_key_pass_through() {
        let app = app();
        for _ in 0..10 {
            let response = app.clone().oneshot(request("/bases/appA/records", None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key("x-ratelimit-global-limit"));
        }
    }

    #[tokio::test]
    async fn test_non_base_paths_only_count_globally() {
        let app = app();
        let response = app.clone().oneshot(request("/whoami", Some("key"))).await.unwrap();
        assert_eq!(response.headers()["x-ratelimit-global-remaining"], "99");
        assert!(!response.headers().contains_key("x-ratelimit-base-limit"));
    }
}
