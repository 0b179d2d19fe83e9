//! Shared key-value store interface backing the rate limiter.
//!
//! # Design Decisions
//! - Only the primitives the algorithms need: atomic counter, sorted-set
//!   window push, hash read/write, delete, pattern listing
//! - `sliding_window_push` is a single atomic unit (trim, count, add, expire)
//! - Time comes from an injectable `Clock` so windows are testable

use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

/// Store failures. Callers decide whether to fail open or closed.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("key '{key}' holds a value of the wrong type")]
    WrongType { key: String },

    #[error("malformed value under '{key}': {message}")]
    Malformed { key: String, message: String },
}

/// Atomic primitives over a store shared by every limiter process.
#[async_trait]
pub trait Store: Send + Sync {
    /// Increment a counter, setting `ttl` only when the key is created.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// In one atomic unit: drop members scored at or below `window_start`,
    /// count the rest, add `member` at `score` and refresh the key's `ttl`.
    /// Returns the count taken before the add.
    async fn sliding_window_push(
        &self,
        key: &str,
        window_start: f64,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> Result<u64, StoreError>;

    /// Remove one member from a sorted set.
    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Lowest score in a sorted set.
    async fn sorted_set_oldest(&self, key: &str) -> Result<Option<f64>, StoreError>;

    /// Read several hash fields; missing fields are `None`.
    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError>;

    /// Write several hash fields and set the key's `ttl`.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)], ttl: Duration) -> Result<(), StoreError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Keys matching a glob pattern: `*` matches any run of characters, `?`
    /// one character, and a backslash escapes the next character.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// Source of wall-clock time in fractional epoch seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += by.as_secs_f64();
    }

    pub fn set(&self, to: f64) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> f64 {
        (**self).now()
    }
}

/// Escape glob metacharacters so `raw` only matches itself.
pub fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Match `key` against a pattern with `*`, `?` and backslash escapes.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();
    let (mut p, mut k) = (0, 0);
    // Last `*` seen and the key position it is currently absorbing up to
    let mut star: Option<(usize, usize)> = None;

    while k < key.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, k));
                p += 1;
                continue;
            }
            Some('?') => {
                p += 1;
                k += 1;
                continue;
            }
            Some('\\') if pattern.get(p + 1) == Some(&key[k]) => {
                p += 2;
                k += 1;
                continue;
            }
            Some(&c) if c != '\\' && c == key[k] => {
                p += 1;
                k += 1;
                continue;
            }
            _ => {}
        }

        match star {
            Some((star_p, star_k)) => {
                p = star_p + 1;
                k = star_k + 1;
                star = Some((star_p, star_k + 1));
            }
            None => return false,
        }
    }

    while pattern.get(p) == Some(&'*') {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("rate_limit:user:fixed:*", "rate_limit:user:fixed:1700000000"));
        assert!(!glob_match("rate_limit:user:fixed:*", "rate_limit:user:sliding"));
        assert!(glob_match("a*c*e", "abcde"));
        assert!(!glob_match("a*c*e", "abde"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("ab*ba", "aba"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
    }

    #[test]
    fn test_escaped_pattern_matches_literally() {
        let pattern = format!("{}:*", escape_glob("user*?[x]"));
        assert_eq!(pattern, "user\\*\\?\\[x\\]:*");
        assert!(glob_match(&pattern, "user*?[x]:fixed:60"));
        assert!(!glob_match(&pattern, "user-a:fixed:60"));
        assert!(!glob_match(&pattern, "userZZ[x]:fixed:60"));
        assert!(glob_match(&escape_glob("a\\b"), "a\\b"));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100.0);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), 101.5);
        clock.set(5.0);
        assert_eq!(clock.now(), 5.0);
    }
}
