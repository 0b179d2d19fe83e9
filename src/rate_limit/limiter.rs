//! Distributed rate limiter.
//!
//! # Algorithms
//! - Sliding window: sorted set of request timestamps; exact rolling count,
//!   storage grows with the limit
//! - Fixed window: one counter per `floor(now / window)`; cheap, but allows
//!   up to twice the limit across a window boundary
//! - Token bucket: hash of {tokens, last_refill}; refills continuously,
//!   smooths bursts without per-request storage
//!
//! # Design Decisions
//! - The algorithm is chosen per check, not per limiter
//! - No client-side caching; every check goes to the store
//! - `retry_after` is rounded up and at least one second on rejection

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Algorithm;
use crate::observability::metrics;
use crate::rate_limit::store::{escape_glob, Clock, Store, StoreError, SystemClock};

/// Tolerance for float drift in token arithmetic. Epoch seconds as f64
/// only resolve to ~0.25µs, which shows up when dividing by short periods.
const TOKEN_EPSILON: f64 = 1e-3;

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::TokenBucket => "token_bucket",
        }
    }
}

/// Result of one rate limit check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// Epoch seconds at which the limit frees up.
    pub reset_time: f64,
    /// Seconds to wait before retrying; 0 when allowed.
    pub retry_after: u64,
    pub limit: u64,
    pub window_seconds: u64,
}

impl RateLimitDecision {
    fn allowed(remaining: u64, reset_time: f64, limit: u64, window_seconds: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_time,
            retry_after: 0,
            limit,
            window_seconds,
        }
    }

    fn rejected(now: f64, reset_time: f64, limit: u64, window_seconds: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_time,
            retry_after: retry_after_secs(reset_time - now),
            limit,
            window_seconds,
        }
    }

    /// Write `X-RateLimit-*` headers, plus `Retry-After` when rejected.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_time.ceil() as u64));
        if !self.allowed {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(self.retry_after));
        }
    }

    /// `Ok(self)` when allowed, otherwise a `RateLimitExceeded` for `identifier`.
    pub fn into_result(self, identifier: &str) -> Result<Self, RateLimitExceeded> {
        if self.allowed {
            Ok(self)
        } else {
            Err(RateLimitExceeded {
                identifier: identifier.to_string(),
                decision: self,
            })
        }
    }
}

fn retry_after_secs(wait: f64) -> u64 {
    (wait.ceil().max(1.0)) as u64
}

/// A rejected rate limit check.
#[derive(Debug, Clone, Error)]
#[error("rate limit exceeded for '{identifier}'; retry after {}s", decision.retry_after)]
pub struct RateLimitExceeded {
    pub identifier: String,
    pub decision: RateLimitDecision,
}

/// Rate limiter over a shared store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn Store>,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>) -> Self {
        Self::with_clock(store, prefix, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn Store>, prefix: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            clock,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, identifier: &str, scope: &str) -> String {
        format!("{}:{}:{}", self.prefix, identifier, scope)
    }

    /// Check and count one request for `identifier`.
    pub async fn is_allowed(
        &self,
        identifier: &str,
        limit: u64,
        window_seconds: u64,
        algorithm: Algorithm,
    ) -> Result<RateLimitDecision, StoreError> {
        let window_seconds = window_seconds.max(1);
        let now = self.clock.now();

        let decision = if limit == 0 {
            RateLimitDecision::rejected(now, now + window_seconds as f64, limit, window_seconds)
        } else {
            match algorithm {
                Algorithm::SlidingWindow => self.sliding_window(identifier, limit, window_seconds, now).await?,
                Algorithm::FixedWindow => self.fixed_window(identifier, limit, window_seconds, now).await?,
                Algorithm::TokenBucket => self.token_bucket(identifier, limit, window_seconds, now).await?,
            }
        };

        if !decision.allowed {
            tracing::debug!(
                limiter = %self.prefix,
                identifier = %identifier,
                algorithm = algorithm.as_str(),
                retry_after = decision.retry_after,
                "Rate limit exceeded"
            );
            metrics::record_rate_limited(&self.prefix, algorithm.as_str());
        }

        Ok(decision)
    }

    /// Like `is_allowed`, with a rejection turned into an error.
    pub async fn check(
        &self,
        identifier: &str,
        limit: u64,
        window_seconds: u64,
        algorithm: Algorithm,
    ) -> Result<RateLimitDecision, crate::error::ResilienceError> {
        let decision = self.is_allowed(identifier, limit, window_seconds, algorithm).await?;
        Ok(decision.into_result(identifier)?)
    }

    async fn sliding_window(
        &self,
        identifier: &str,
        limit: u64,
        window_seconds: u64,
        now: f64,
    ) -> Result<RateLimitDecision, StoreError> {
        let key = self.key(identifier, "sliding");
        let window = window_seconds as f64;
        let member = format!("{:.6}-{}", now, Uuid::new_v4());

        let count = self
            .store
            .sliding_window_push(&key, now - window, &member, now, Duration::from_secs(window_seconds))
            .await?;

        if count >= limit {
            self.store.sorted_set_remove(&key, &member).await?;
            let oldest = self.store.sorted_set_oldest(&key).await?;
            let reset_time = oldest.map_or(now + window, |t| t + window);
            return Ok(RateLimitDecision::rejected(now, reset_time, limit, window_seconds));
        }

        Ok(RateLimitDecision::allowed(limit - count - 1, now + window, limit, window_seconds))
    }

    async fn fixed_window(
        &self,
        identifier: &str,
        limit: u64,
        window_seconds: u64,
        now: f64,
    ) -> Result<RateLimitDecision, StoreError> {
        let window_start = (now as u64 / window_seconds) * window_seconds;
        let key = self.key(identifier, &format!("fixed:{}", window_start));
        let reset_time = (window_start + window_seconds) as f64;

        let count = self
            .store
            .increment(&key, Duration::from_secs(window_seconds))
            .await?;

        if count > limit {
            return Ok(RateLimitDecision::rejected(now, reset_time, limit, window_seconds));
        }

        Ok(RateLimitDecision::allowed(limit - count, reset_time, limit, window_seconds))
    }

    async fn token_bucket(
        &self,
        identifier: &str,
        limit: u64,
        refill_period: u64,
        now: f64,
    ) -> Result<RateLimitDecision, StoreError> {
        let key = self.key(identifier, "bucket");
        let capacity = limit as f64;
        let secs_per_token = refill_period as f64 / capacity;

        let fields = self.store.hash_get(&key, &["tokens", "last_refill"]).await?;
        let tokens = match (fields.first().cloned().flatten(), fields.get(1).cloned().flatten()) {
            (Some(tokens), Some(last_refill)) => {
                let tokens = parse_field(&key, &tokens)?;
                let last_refill = parse_field(&key, &last_refill)?;
                let elapsed = (now - last_refill).max(0.0);
                let refilled = (tokens + elapsed / secs_per_token).min(capacity);

                if refilled + TOKEN_EPSILON < 1.0 {
                    let wait = (1.0 - refilled) * secs_per_token;
                    return Ok(RateLimitDecision::rejected(now, now + wait, limit, refill_period));
                }
                (refilled - 1.0).max(0.0)
            }
            // New bucket starts full; this request takes one token
            _ => capacity - 1.0,
        };

        self.store
            .hash_set(
                &key,
                &[("tokens", tokens.to_string()), ("last_refill", now.to_string())],
                Duration::from_secs(refill_period * 2),
            )
            .await?;

        Ok(RateLimitDecision::allowed(
            (tokens + TOKEN_EPSILON).floor() as u64,
            now + (capacity - tokens) * secs_per_token,
            limit,
            refill_period,
        ))
    }

    /// Delete every key held for `identifier`. Returns the number deleted.
    pub async fn reset(&self, identifier: &str) -> Result<u64, StoreError> {
        let mut keys = vec![self.key(identifier, "sliding"), self.key(identifier, "bucket")];
        let fixed = format!("{}*", escape_glob(&self.key(identifier, "fixed:")));
        keys.extend(self.store.keys(&fixed).await?);

        let deleted = self.store.delete(&keys).await?;
        tracing::info!(limiter = %self.prefix, identifier = %identifier, deleted, "Rate limit reset");
        Ok(deleted)
    }
}

fn parse_field(key: &str, raw: &str) -> Result<f64, StoreError> {
    raw.parse().map_err(|_| StoreError::Malformed {
        key: key.to_string(),
        message: format!("expected a number, got '{}'", raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::memory::MemoryStore;
    use crate::rate_limit::store::ManualClock;

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (RateLimiter::with_clock(store, "rate_limit", clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_sliding_window_exact_limit() {
        let (limiter, clock) = limiter();

        for i in 0..5 {
            let d = limiter.is_allowed("user", 5, 10, Algorithm::SlidingWindow).await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.remaining, 4 - i);
            clock.advance(Duration::from_secs(1));
        }

        let d = limiter.is_allowed("user", 5, 10, Algorithm::SlidingWindow).await.unwrap();
        assert!(!d.allowed);
        // Oldest entry was at t+0, now is t+5
        assert_eq!(d.retry_after, 5);

        // The rejected request left no trace: after the first entry ages out one slot frees up
        clock.advance(Duration::from_secs(5));
        assert!(limiter.is_allowed("user", 5, 10, Algorithm::SlidingWindow).await.unwrap().allowed);
        assert!(!limiter.is_allowed("user", 5, 10, Algorithm::SlidingWindow).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_sliding_window_recovers_after_quiet_window() {
        let (limiter, clock) = limiter();
        for _ in 0..3 {
            limiter.is_allowed("k", 3, 60, Algorithm::SlidingWindow).await.unwrap();
        }
        assert!(!limiter.is_allowed("k", 3, 60, Algorithm::SlidingWindow).await.unwrap().allowed);

        clock.advance(Duration::from_secs(60));
        let d = limiter.is_allowed("k", 3, 60, Algorithm::SlidingWindow).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 2);
    }

    #[tokio::test]
    async fn test_fixed_window_allows_double_burst_at_boundary() {
        let (limiter, clock) = limiter();
        // 1_700_000_000 is divisible by 10; move to the last instant of the window
        clock.advance(Duration::from_millis(9_990));

        for _ in 0..4 {
            assert!(limiter.is_allowed("burst", 4, 10, Algorithm::FixedWindow).await.unwrap().allowed);
        }
        let rejected = limiter.is_allowed("burst", 4, 10, Algorithm::FixedWindow).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after, 1);

        clock.advance(Duration::from_millis(20));
        for _ in 0..4 {
            assert!(limiter.is_allowed("burst", 4, 10, Algorithm::FixedWindow).await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_token_bucket_refills_one_token() {
        let (limiter, clock) = limiter();

        for _ in 0..10 {
            assert!(limiter.is_allowed("tb", 10, 1, Algorithm::TokenBucket).await.unwrap().allowed);
        }
        let rejected = limiter.is_allowed("tb", 10, 1, Algorithm::TokenBucket).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after, 1);

        clock.advance(Duration::from_millis(100));
        let d = limiter.is_allowed("tb", 10, 1, Algorithm::TokenBucket).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
        assert!(!limiter.is_allowed("tb", 10, 1, Algorithm::TokenBucket).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_clears_every_algorithm() {
        let (limiter, _) = limiter();
        for algorithm in [Algorithm::SlidingWindow, Algorithm::FixedWindow, Algorithm::TokenBucket] {
            limiter.is_allowed("user", 1, 60, algorithm).await.unwrap();
            assert!(!limiter.is_allowed("user", 1, 60, algorithm).await.unwrap().allowed);
        }

        assert_eq!(limiter.reset("user").await.unwrap(), 3);

        for algorithm in [Algorithm::SlidingWindow, Algorithm::FixedWindow, Algorithm::TokenBucket] {
            assert!(limiter.is_allowed("user", 1, 60, algorithm).await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_reset_with_glob_characters_only_touches_own_keys() {
        let (limiter, _) = limiter();
        limiter.is_allowed("user", 1, 60, Algorithm::FixedWindow).await.unwrap();
        limiter.is_allowed("us*", 1, 60, Algorithm::FixedWindow).await.unwrap();

        assert_eq!(limiter.reset("us*").await.unwrap(), 1);
        assert_eq!(limiter.reset("u?er").await.unwrap(), 0);

        // "user" still has its counter
        assert!(!limiter.is_allowed("user", 1, 60, Algorithm::FixedWindow).await.unwrap().allowed);
        assert!(limiter.is_allowed("us*", 1, 60, Algorithm::FixedWindow).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_headers_and_error_conversion() {
        let (limiter, _) = limiter();
        limiter.is_allowed("h", 1, 30, Algorithm::SlidingWindow).await.unwrap();
        let decision = limiter.is_allowed("h", 1, 30, Algorithm::SlidingWindow).await.unwrap();

        let mut headers = HeaderMap::new();
        decision.apply_headers(&mut headers);
        assert_eq!(headers["x-ratelimit-limit"], "1");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["retry-after"], "30");

        let err = decision.into_result("h").unwrap_err();
        assert_eq!(err.identifier, "h");
    }

    #[tokio::test]
    async fn test_zero_limit_rejects_without_store() {
        let (limiter, _) = limiter();
        let d = limiter.is_allowed("none", 0, 5, Algorithm::TokenBucket).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.retry_after, 5);
    }
}
