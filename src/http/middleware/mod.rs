//! Inbound axum middleware.
//!
//! # Data Flow
//! ```text
//! Request
//!     → rate_limit.rs: per-client limit (key from API key hash or client IP)
//!     → airtable.rs: Airtable global and per-base quotas
//!     → circuit_breaker.rs: breaker per "{method}-{normalized path}"
//!     → handler
//! ```
//!
//! # Design Decisions
//! - Each middleware is an `async fn` used with `from_fn_with_state`
//! - Rejections render through `ResilienceError`, so bodies and headers
//!   match what handlers return for the same error
//! - Rate limiting fails open on store errors unless configured otherwise

pub mod airtable;
pub mod circuit_breaker;
pub mod rate_limit;

pub use airtable::{airtable_rate_limit_middleware, AirtableLimitState};
pub use circuit_breaker::{circuit_breaker_middleware, BreakerMiddlewareState};
pub use rate_limit::{rate_limit_middleware, RateLimitState};
