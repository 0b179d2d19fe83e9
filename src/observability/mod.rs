//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Breakers, limiters and clients produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters and gauges via the `metrics` facade)
//!
//! Consumers:
//!     → Log aggregation (stdout, JSON lines)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Metrics are fire-and-forget; with no recorder installed they are no-ops
//! - Nothing in the resilience core depends on observability succeeding

pub mod logging;
pub mod metrics;
