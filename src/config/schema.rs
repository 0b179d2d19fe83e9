//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the resilience
//! layer. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for a service embedding the resilience layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Identity of the service owning this configuration.
    pub service: ServiceIdentity,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Default circuit breaker settings for breakers created without an explicit config.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Circuit breaker registry behavior.
    pub registry: RegistryConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Shared key-value store backing the rate limiters.
    pub store: StoreConfig,

    /// Rate limiting middleware defaults.
    pub rate_limit: RateLimitConfig,

    /// Upstream services reached through resilient clients.
    pub services: Vec<ServiceConfig>,
}

/// Service identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceIdentity {
    /// Service name, used in the client User-Agent and in logs.
    pub name: String,

    /// Service version.
    pub version: String,
}

impl Default for ServiceIdentity {
    fn default() -> Self {
        Self {
            name: "pyairtable-service".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint. Off by default.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}

/// Circuit breaker configuration. Immutable once a breaker is created.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// Consecutive successes in half-open before the circuit closes.
    pub success_threshold: u32,

    /// Initial open-state duration in milliseconds.
    pub timeout_ms: u64,

    /// Ceiling for the open-state duration after backoff, in milliseconds.
    pub max_timeout_ms: u64,

    /// Growth factor applied to the open duration on each failed probe.
    pub backoff_multiplier: f64,

    /// Deadline for a single protected call, in milliseconds.
    pub response_timeout_ms: u64,

    /// Failure fraction over the rolling sample that opens the circuit.
    pub error_rate_threshold: f64,

    /// Latency in milliseconds above which a call counts as slow.
    pub slow_request_threshold_ms: u64,

    /// Slow-call fraction over the rolling sample that opens the circuit.
    pub slow_request_rate_threshold: f64,

    /// Recorded requests required before the rate-based checks are evaluated.
    pub minimum_request_volume: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_ms: 60_000,
            max_timeout_ms: 300_000,
            backoff_multiplier: 2.0,
            response_timeout_ms: 30_000,
            error_rate_threshold: 0.5,
            slow_request_threshold_ms: 5000,
            slow_request_rate_threshold: 0.3,
            minimum_request_volume: 10,
        }
    }
}

/// Predefined breaker tunings for common service types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerProfile {
    /// LLM calls: slow and expensive, trip early.
    LlmService,
    /// Gateway-to-service calls.
    ApiGateway,
    /// Database-backed services: fast, low error tolerance.
    DatabaseService,
    /// Third-party APIs: unreliable, long recovery window.
    ExternalApi,
}

/// Circuit breaker registry configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// What to do when a breaker is requested with a config that differs
    /// from the one it was created with.
    pub conflict_policy: ConfigConflictPolicy,
}

/// Policy for `get_breaker` calls whose config differs from the registered breaker's.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigConflictPolicy {
    /// Return the existing breaker unchanged and log a warning.
    #[default]
    KeepExisting,
    /// Fail the lookup with a configuration conflict error.
    Reject,
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Base delay for backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Base of the exponential strategy.
    pub exponential_base: f64,

    /// Scale each delay by a random factor in [0.5, 1.0].
    pub jitter: bool,

    /// How the delay grows with the attempt index.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Delay growth strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// Shared store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis URL. When unset an in-process store is used, which only
    /// limits within one process. Setting it requires the `redis-store`
    /// feature.
    pub redis_url: Option<String>,

    /// Key prefix for the generic rate limiter.
    pub key_prefix: String,

    /// Allow requests through when the store is unreachable.
    pub fail_open: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "rate_limit".to_string(),
            fail_open: true,
        }
    }
}

/// Rate limiting middleware configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Requests allowed per window per client.
    pub limit: u64,

    /// Window length in seconds.
    pub window_secs: u64,

    /// Algorithm used for the check.
    pub algorithm: Algorithm,

    /// Paths never rate limited.
    pub exclude_paths: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 60,
            window_secs: 60,
            algorithm: Algorithm::SlidingWindow,
            exclude_paths: vec!["/health".to_string(), "/metrics".to_string()],
        }
    }
}

/// Rate limiting algorithm, chosen per check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    SlidingWindow,
    FixedWindow,
    TokenBucket,
}

/// An upstream service reached through a resilient client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Unique service name; prefixes the names of its circuit breakers.
    pub name: String,

    /// Base URL (e.g., "http://mcp-server:8001").
    pub base_url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,

    /// Idle keep-alive connections kept per host.
    #[serde(default = "default_idle_connections")]
    pub max_idle_connections: usize,

    /// Breaker tuning preset.
    #[serde(default)]
    pub profile: Option<BreakerProfile>,

    /// Explicit breaker config; wins over `profile`.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

fn default_service_timeout() -> u64 {
    30
}

fn default_idle_connections() -> usize {
    20
}
