//! Per-endpoint circuit breaker middleware.
//!
//! Each route gets a breaker named `{method}-{path}`, with id-like path
//! segments folded to `{id}` so `/bases/app123/tables` and
//! `/bases/app456/tables` share one breaker. Responses with a 5xx status
//! count as failures but still reach the client unchanged.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::CircuitBreakerConfig;
use crate::error::{breaker_open_response, ResilienceError};
use crate::resilience::circuit_breaker::BreakerError;
use crate::resilience::registry::CircuitBreakerRegistry;

/// Paths containing any of these never go through a breaker.
pub const SKIP_PATTERNS: [&str; 5] = ["/health", "/metrics", "/docs", "/openapi.json", "/favicon.ico"];

pub struct BreakerMiddlewareState {
    registry: Arc<CircuitBreakerRegistry>,
    default_config: CircuitBreakerConfig,
    endpoint_configs: HashMap<String, CircuitBreakerConfig>,
}

impl BreakerMiddlewareState {
    /// State with the middleware default: 5 failures, 3 successes, 60s open, 30s response timeout.
    pub fn new(registry: Arc<CircuitBreakerRegistry>) -> Self {
        let default_config = CircuitBreakerConfig::default()
            .with_failure_threshold(5)
            .with_success_threshold(3)
            .with_timeout(Duration::from_secs(60))
            .with_response_timeout(Duration::from_secs(30));
        Self::with_default_config(registry, default_config)
    }

    pub fn with_default_config(registry: Arc<CircuitBreakerRegistry>, default_config: CircuitBreakerConfig) -> Self {
        Self {
            registry,
            default_config,
            endpoint_configs: HashMap::new(),
        }
    }

    /// Override the config for one endpoint, keyed by breaker name (e.g. `post-bases-{id}-records`).
    pub fn with_endpoint_config(mut self, endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.endpoint_configs.insert(endpoint.into(), config);
        self
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    fn config_for(&self, endpoint: &str) -> &CircuitBreakerConfig {
        self.endpoint_configs.get(endpoint).unwrap_or(&self.default_config)
    }
}

pub fn should_skip(path: &str) -> bool {
    SKIP_PATTERNS.iter().any(|pattern| path.contains(pattern))
}

fn is_id_segment(segment: &str) -> bool {
    segment.chars().all(|c| c.is_ascii_digit())
        || (segment.len() == 36 && segment.contains('-'))
        || segment.starts_with("session-")
        || segment.starts_with("user-")
        || segment.starts_with("app")
}

/// Replace id-like segments with `{id}`, dropping empty segments.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| if is_id_segment(s) { "{id}" } else { s })
        .collect();
    format!("/{}", segments.join("/"))
}

/// Breaker name for a request: `get-bases-{id}-tables`.
pub fn endpoint_name(method: &Method, path: &str) -> String {
    let normalized = normalize_path(path).replace('/', "-");
    format!("{}-{}", method.as_str().to_lowercase(), normalized.trim_matches('-'))
}

/// A 5xx response carried through the breaker as a failure.
struct ServerErrorResponse(Response);

impl fmt::Display for ServerErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler responded with HTTP {}", self.0.status())
    }
}

pub async fn circuit_breaker_middleware(
    State(state): State<Arc<BreakerMiddlewareState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if should_skip(request.uri().path()) {
        return next.run(request).await;
    }

    let endpoint = endpoint_name(request.method(), request.uri().path());
    let breaker = match state.registry.get_breaker(&endpoint, Some(state.config_for(&endpoint))) {
        Ok(breaker) => breaker,
        Err(err) => return err.into_response(),
    };

    let outcome = breaker
        .call(move || async move {
            let response = next.run(request).await;
            if response.status().is_server_error() {
                Err(ServerErrorResponse(response))
            } else {
                Ok(response)
            }
        })
        .await;

    match outcome {
        Ok(response) => response,
        Err(BreakerError::Inner(ServerErrorResponse(response))) => response,
        Err(BreakerError::Open(open)) => {
            tracing::warn!(endpoint = %endpoint, state = %open.state, "Circuit breaker open; rejecting request");
            breaker_open_response(&open, Some(&endpoint))
        }
        Err(BreakerError::Timeout { breaker, timeout }) => {
            ResilienceError::UpstreamTimeout { breaker, timeout }.into_response()
        }
    }
}
