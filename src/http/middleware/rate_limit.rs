//! Per-client rate limiting middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::{Algorithm, RateLimitConfig};
use crate::error::ResilienceError;
use crate::rate_limit::{hash_api_key, RateLimitExceeded, RateLimiter};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const USER_ID_HEADER: &str = "x-user-id";

/// Derives the rate limit identifier from a request.
pub type KeyFn = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

/// `api_key:{hash}` when an API key is sent, else `ip:{client ip}`.
///
/// The client IP comes from `ConnectInfo`, so serve with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn client_key(request: &Request<Body>) -> String {
    if let Some(api_key) = request.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return format!("api_key:{}", hash_api_key(api_key));
    }

    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
        None => "ip:unknown".to_string(),
    }
}

/// `user:{id}` from `x-user-id`, falling back to [`client_key`].
pub fn user_key(request: &Request<Body>) -> String {
    match request.headers().get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
        Some(user) => format!("user:{}", user),
        None => client_key(request),
    }
}

/// Every request counts against one internal service.
pub fn service_key(service: &str) -> KeyFn {
    let key = format!("service:{}", service);
    Arc::new(move |_| key.clone())
}

pub struct RateLimitState {
    limiter: RateLimiter,
    enabled: bool,
    limit: u64,
    window_secs: u64,
    algorithm: Algorithm,
    exclude_paths: Vec<String>,
    fail_open: bool,
    key_fn: KeyFn,
}

impl RateLimitState {
    pub fn new(limiter: RateLimiter, config: &RateLimitConfig) -> Self {
        Self {
            limiter,
            enabled: config.enabled,
            limit: config.limit,
            window_secs: config.window_secs,
            algorithm: config.algorithm,
            exclude_paths: config.exclude_paths.clone(),
            fail_open: true,
            key_fn: Arc::new(client_key),
        }
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }

    fn is_excluded(&self, path: &str) -> bool {
        !self.enabled || self.exclude_paths.iter().any(|p| p == path)
    }
}

pub async fn rate_limit_middleware(
    State(state): State<Arc<RateLimitState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if state.is_excluded(request.uri().path()) {
        return next.run(request).await;
    }

    let key = (state.key_fn)(&request);
    let decision = state
        .limiter
        .is_allowed(&key, state.limit, state.window_secs, state.algorithm)
        .await;

    match decision {
        Ok(decision) if decision.allowed => {
            let mut response = next.run(request).await;
            decision.apply_headers(response.headers_mut());
            response
        }
        Ok(decision) => {
            tracing::warn!(
                key = %key,
                path = %request.uri().path(),
                limit = decision.limit,
                retry_after = decision.retry_after,
                "Rate limit exceeded"
            );
            ResilienceError::RateLimited(RateLimitExceeded {
                identifier: key,
                decision,
            })
            .into_response()
        }
        Err(err) if state.fail_open => {
            tracing::warn!(error = %err, key = %key, "Rate limit store unavailable; allowing request");
            next.run(request).await
        }
        Err(err) => ResilienceError::StoreUnavailable(err).into_response(),
    }
}
