//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ResilienceConfig (validated, immutable)
//!     → lifecycle::ResilienceContext builds registries and limiters from it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; breakers keep the config they were created with
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    Algorithm, BackoffStrategy, BreakerProfile, CircuitBreakerConfig, ConfigConflictPolicy,
    LogFormat, ObservabilityConfig, RateLimitConfig, RegistryConfig, ResilienceConfig,
    RetryConfig, ServiceConfig, ServiceIdentity, StoreConfig,
};
pub use validation::{validate_config, ValidationError};
