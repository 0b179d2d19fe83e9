//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to an upstream:
//!     → retries.rs (optional: retry transient failures with backoff.rs delays)
//!     → registry.rs (breaker for the logical resource, created on first use)
//!     → circuit_breaker.rs (fail fast if open, else run under response timeout)
//!     → stats.rs (record outcome, evaluate transitions)
//!     → caller sees the value, the operation's own error, or a breaker-open signal
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every protected call has a deadline
//! - Breakers never swallow errors, they only short-circuit later calls
//! - Retry is a separate layer composed on top, never hidden inside a breaker
//! - No background timers; open → half-open is evaluated lazily per call

pub mod backoff;
pub mod circuit_breaker;
pub mod registry;
pub mod retries;
pub mod stats;

pub use circuit_breaker::{
    BreakerError, BreakerOpenError, CircuitBreaker, CircuitBreakerSnapshot, CircuitState,
};
pub use registry::{CircuitBreakerRegistry, RegistryStats};
pub use retries::{
    retry_async, retry_with_circuit_breaker, OpenCircuitPolicy, RetryHook, RetryPolicy,
};
pub use stats::{CircuitBreakerStats, StateChange, StatsSnapshot};
