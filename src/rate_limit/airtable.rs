//! Airtable API quota policies.
//!
//! The numbers mirror Airtable's published limits: 5 requests per second per
//! base. All algorithm work is delegated to [`RateLimiter`].

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::config::Algorithm;
use crate::observability::metrics;
use crate::rate_limit::limiter::{RateLimitDecision, RateLimiter};
use crate::rate_limit::store::{Clock, Store, StoreError};

pub const AIRTABLE_PREFIX: &str = "airtable";

/// Requests per second allowed against a single base.
pub const BASE_LIMIT: u64 = 5;
pub const BASE_WINDOW_SECS: u64 = 1;
/// Requests per minute allowed per API credential.
pub const GLOBAL_LIMIT: u64 = 100;
pub const GLOBAL_WINDOW_SECS: u64 = 60;
/// Requests per second allowed per internal service.
pub const SERVICE_LIMIT: u64 = 50;
pub const SERVICE_WINDOW_SECS: u64 = 1;

/// Short, stable identifier for an API key; the key itself never reaches the store.
pub fn hash_api_key(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    let mut hashed = hex::encode(digest);
    hashed.truncate(12);
    hashed
}

#[derive(Clone)]
pub struct AirtableRateLimiter {
    limiter: RateLimiter,
}

impl AirtableRateLimiter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            limiter: RateLimiter::new(store, AIRTABLE_PREFIX),
        }
    }

    pub fn with_clock(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter: RateLimiter::with_clock(store, AIRTABLE_PREFIX, clock),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Per-base limit: 5 requests per second.
    pub async fn check_base_limit(&self, base_id: &str) -> Result<RateLimitDecision, StoreError> {
        let decision = self
            .limiter
            .is_allowed(&format!("base:{}", base_id), BASE_LIMIT, BASE_WINDOW_SECS, Algorithm::SlidingWindow)
            .await?;

        metrics::record_airtable_remaining(base_id, decision.remaining);
        if !decision.allowed {
            metrics::record_airtable_limit_hit(base_id, "base");
            tracing::warn!(base_id = %base_id, retry_after = decision.retry_after, "Airtable base rate limit hit");
        }
        Ok(decision)
    }

    /// Per-credential limit: 100 requests per minute. Takes the hashed key.
    pub async fn check_global_limit(&self, api_key_hash: &str) -> Result<RateLimitDecision, StoreError> {
        let decision = self
            .limiter
            .is_allowed(
                &format!("global:{}", api_key_hash),
                GLOBAL_LIMIT,
                GLOBAL_WINDOW_SECS,
                Algorithm::SlidingWindow,
            )
            .await?;

        if !decision.allowed {
            metrics::record_airtable_limit_hit("global", "global");
            tracing::warn!(api_key_hash = %api_key_hash, "Airtable global rate limit hit");
        }
        Ok(decision)
    }

    /// Per-service limit on internal callers: 50 requests per second.
    pub async fn check_service_limit(&self, service_name: &str) -> Result<RateLimitDecision, StoreError> {
        let decision = self
            .limiter
            .is_allowed(
                &format!("service:{}", service_name),
                SERVICE_LIMIT,
                SERVICE_WINDOW_SECS,
                Algorithm::SlidingWindow,
            )
            .await?;

        if !decision.allowed {
            metrics::record_airtable_limit_hit(service_name, "service");
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::memory::MemoryStore;
    use crate::rate_limit::store::ManualClock;
    use std::time::Duration;

    fn airtable() -> (AirtableRateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (AirtableRateLimiter::with_clock(store, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_sixth_base_request_in_a_second_is_rejected() {
        let (limiter, clock) = airtable();

        for _ in 0..5 {
            assert!(limiter.check_base_limit("appXYZ").await.unwrap().allowed);
            clock.advance(Duration::from_millis(100));
        }

        let sixth = limiter.check_base_limit("appXYZ").await.unwrap();
        assert!(!sixth.allowed);
        assert_eq!(sixth.retry_after, 1);
        assert_eq!(sixth.limit, 5);

        // Other bases are unaffected
        assert!(limiter.check_base_limit("appOTHER").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_service_and_global_scopes() {
        let (limiter, _) = airtable();
        let first = limiter.check_service_limit("mcp-server").await.unwrap();
        assert_eq!(first.remaining, 49);

        let global = limiter.check_global_limit(&hash_api_key("key")).await.unwrap();
        assert_eq!(global.remaining, 99);
        assert_eq!(global.window_seconds, 60);
    }

    #[test]
    fn test_api_key_hash_is_short_and_stable() {
        let a = hash_api_key("patSecret.123");
        assert_eq!(a.len(), 12);
        assert_eq!(a, hash_api_key("patSecret.123"));
        assert_ne!(a, hash_api_key("patSecret.124"));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
