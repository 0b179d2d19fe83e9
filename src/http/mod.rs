//! HTTP subsystem: outbound resilient clients and inbound axum middleware.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     ServiceRegistry (registry.rs, one client per service)
//!     → ResilientHttpClient (client.rs)
//!         → CircuitBreakerRegistry: breaker "{service}-{endpoint}"
//!         → HttpTransport (transport.rs, reqwest)
//!
//! Inbound:
//!     Request
//!     → middleware/rate_limit.rs or middleware/airtable.rs (429 when over limit)
//!     → middleware/circuit_breaker.rs (503 when the endpoint breaker is open)
//!     → handler
//! ```
//!
//! # Design Decisions
//! - Inbound and outbound share the same breaker and limiter types
//! - Middleware are plain `from_fn_with_state` functions over `Arc` state

pub mod client;
pub mod middleware;
pub mod registry;
pub mod transport;

pub use client::{ClientOptions, RequestOptions, ResilientHttpClient};
pub use registry::{ServicePreset, ServiceRegistry};
pub use transport::{HttpTransport, ReqwestTransport, TransportError, TransportRequest, TransportResponse};
