//! Distributed rate limiting subsystem.
//!
//! # Data Flow
//! ```text
//! check(identifier, limit, window, algorithm)
//!     → limiter.rs (pick algorithm, build keys "{prefix}:{identifier}:{scope}")
//!     → store.rs (Store trait: atomic counter / sorted set / hash primitives)
//!         → memory.rs (in-process, DashMap)
//!         → redis_store.rs (shared across processes, feature `redis-store`)
//!     → RateLimitDecision {allowed, remaining, reset_time, retry_after, ...}
//!
//! airtable.rs pins the Airtable quotas on top of limiter.rs
//! ```
//!
//! # Design Decisions
//! - Correctness across processes rests on the store's atomic primitives;
//!   there is no in-process locking between limiter instances
//! - Store failures are returned, never hidden; callers choose fail-open
//!   or fail-closed (the middleware fails open by default)

pub mod airtable;
pub mod limiter;
pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod store;

use std::sync::Arc;

use crate::config::StoreConfig;

pub use airtable::{hash_api_key, AirtableRateLimiter};
pub use limiter::{RateLimitDecision, RateLimitExceeded, RateLimiter};
pub use memory::MemoryStore;
pub use store::{escape_glob, Clock, ManualClock, Store, StoreError, SystemClock};

/// Build the store described by `config`.
///
/// Without a Redis URL limits are enforced per process only. A Redis URL
/// in a build without the `redis-store` feature is an error, never a
/// silent downgrade to per-process limits.
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn Store>, StoreError> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "redis-store")]
        Some(url) => Ok(Arc::new(redis_store::RedisStore::connect(url).await?)),
        #[cfg(not(feature = "redis-store"))]
        Some(url) => {
            tracing::error!(url = %url, "redis_url set but built without the redis-store feature");
            Err(StoreError::Connection(format!(
                "redis_url '{}' requires the redis-store feature",
                url
            )))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}
