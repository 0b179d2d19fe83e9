//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → ResilienceContext::from_config
//!     (breakers → store → limiters → service clients)
//!     → run startup hooks
//!
//! Shutdown (hooks.rs):
//!     Run shutdown hooks in reverse → close service clients
//! ```
//!
//! # Design Decisions
//! - Ordered startup, fail fast on the first error
//! - Shutdown never stops early; failures are logged

pub mod hooks;
pub mod startup;

pub use hooks::{hook, Hook, LifecycleHooks};
pub use startup::ResilienceContext;
