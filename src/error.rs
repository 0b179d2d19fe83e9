//! Error taxonomy shared by breakers, limiters, retries and clients.
//!
//! # Design Decisions
//! - One enum callers match on; lower layers keep their own error types
//!   (`StoreError`, `TransportError`, `ConfigError`) and convert into it
//! - `Retryable` decides what the retry layer may repeat; breaker-open,
//!   validation and auth failures are terminal
//! - At the HTTP boundary errors render as JSON without internal detail

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::config::ConfigError;
use crate::rate_limit::{RateLimitExceeded, StoreError};
use crate::resilience::circuit_breaker::{BreakerError, BreakerOpenError};

/// Errors surfaced by the resilience layer.
#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error(transparent)]
    BreakerOpen(#[from] BreakerOpenError),

    #[error("call through '{breaker}' timed out after {timeout:?}")]
    UpstreamTimeout { breaker: String, timeout: Duration },

    #[error("{service} responded with HTTP {status}")]
    UpstreamStatus {
        service: String,
        status: u16,
        body: String,
    },

    #[error("connection to {service} failed: {message}")]
    Connection { service: String, message: String },

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error("rate limit store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Explicit marker for failures the caller knows are transient.
    #[error("{0}")]
    Retryable(String),

    #[error("circuit breaker '{name}' is already registered with a different config")]
    BreakerConfigConflict { name: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ResilienceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ResilienceError::BreakerOpen(_) | ResilienceError::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ResilienceError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ResilienceError::UpstreamStatus { .. } | ResilienceError::Connection { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ResilienceError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ResilienceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ResilienceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ResilienceError::Retryable(_)
            | ResilienceError::BreakerConfigConflict { .. }
            | ResilienceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for response bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            ResilienceError::BreakerOpen(_) => "CIRCUIT_BREAKER_OPEN",
            ResilienceError::UpstreamTimeout { .. } => "TIMEOUT",
            ResilienceError::UpstreamStatus { .. } | ResilienceError::Connection { .. } => {
                "EXTERNAL_SERVICE_ERROR"
            }
            ResilienceError::RateLimited(_) => "RATE_LIMIT",
            ResilienceError::StoreUnavailable(_) => "SERVICE_UNAVAILABLE",
            ResilienceError::Validation(_) => "VALIDATION_ERROR",
            ResilienceError::Unauthorized(_) => "AUTH_ERROR",
            ResilienceError::Retryable(_)
            | ResilienceError::BreakerConfigConflict { .. }
            | ResilienceError::Config(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<BreakerError<ResilienceError>> for ResilienceError {
    fn from(err: BreakerError<ResilienceError>) -> Self {
        match err {
            BreakerError::Open(open) => ResilienceError::BreakerOpen(open),
            BreakerError::Timeout { breaker, timeout } => {
                ResilienceError::UpstreamTimeout { breaker, timeout }
            }
            BreakerError::Inner(inner) => inner,
        }
    }
}

/// Classification used by the retry layer.
pub trait Retryable {
    /// Whether repeating the operation may succeed.
    fn is_retryable(&self) -> bool;

    /// Whether this failure is a circuit breaker refusing the call.
    fn is_breaker_open(&self) -> bool {
        false
    }
}

impl Retryable for ResilienceError {
    fn is_retryable(&self) -> bool {
        match self {
            ResilienceError::RateLimited(_)
            | ResilienceError::UpstreamTimeout { .. }
            | ResilienceError::Connection { .. }
            | ResilienceError::Retryable(_) => true,
            ResilienceError::UpstreamStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    fn is_breaker_open(&self) -> bool {
        matches!(self, ResilienceError::BreakerOpen(_))
    }
}

impl<E: Retryable> Retryable for BreakerError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            BreakerError::Open(_) => false,
            BreakerError::Timeout { .. } => true,
            BreakerError::Inner(inner) => inner.is_retryable(),
        }
    }

    fn is_breaker_open(&self) -> bool {
        match self {
            BreakerError::Open(_) => true,
            BreakerError::Timeout { .. } => false,
            BreakerError::Inner(inner) => inner.is_breaker_open(),
        }
    }
}

impl IntoResponse for ResilienceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        match self {
            ResilienceError::BreakerOpen(open) => breaker_open_response(&open, None),
            ResilienceError::RateLimited(exceeded) => {
                let body = json!({
                    "error": "Rate limit exceeded",
                    "error_code": code,
                    "limit": exceeded.decision.limit,
                    "window_seconds": exceeded.decision.window_seconds,
                    "retry_after": exceeded.decision.retry_after,
                });
                let mut response = (status, Json(body)).into_response();
                exceeded.decision.apply_headers(response.headers_mut());
                response
            }
            other => {
                let message = match &other {
                    ResilienceError::UpstreamTimeout { .. } => "Upstream request timed out",
                    ResilienceError::UpstreamStatus { .. } | ResilienceError::Connection { .. } => {
                        "Upstream service error"
                    }
                    ResilienceError::StoreUnavailable(_) => "Service temporarily unavailable",
                    ResilienceError::Validation(_) => "Validation failed",
                    ResilienceError::Unauthorized(_) => "Unauthorized",
                    _ => "Internal server error",
                };
                if status.is_server_error() {
                    tracing::error!(error = %other, status = status.as_u16(), "Request failed");
                }
                (status, Json(json!({ "error": message, "error_code": code }))).into_response()
            }
        }
    }
}

/// 503 response for a rejecting breaker, naming the endpoint when known.
pub fn breaker_open_response(open: &BreakerOpenError, endpoint: Option<&str>) -> Response {
    let retry_after = open.retry_after_secs();
    let body = json!({
        "error": "Service temporarily unavailable",
        "error_code": "CIRCUIT_BREAKER_OPEN",
        "circuit_breaker": open.name,
        "endpoint": endpoint,
        "state": open.state,
        "retry_after": retry_after,
        "stats": {
            "error_rate": open.stats.error_rate,
            "consecutive_failures": open.stats.consecutive_failures,
        },
    });

    let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    headers.insert("x-circuit-breaker-state", HeaderValue::from_static(open.state.as_str()));
    response
}
