//! Resilience core for the Airtable service mesh.
//!
//! Circuit breakers, a store-backed rate limiter, retries with backoff and
//! breaker-protected HTTP clients, shared by every service in the mesh.

// Core
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod resilience;

// Service edges
pub mod health;
pub mod http;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ResilienceConfig;
pub use error::{ResilienceError, Retryable};
pub use http::{ResilientHttpClient, ServiceRegistry};
pub use lifecycle::ResilienceContext;
pub use rate_limit::{AirtableRateLimiter, RateLimiter};
pub use resilience::{
    retry_async, retry_with_circuit_breaker, CircuitBreaker, CircuitBreakerRegistry, CircuitState, RetryPolicy,
};
