//! In-process store.
//!
//! Backs the limiter when no Redis URL is configured and in tests. Limits
//! are only shared between tasks of one process.
//!
//! Expired keys are dropped when touched, and every `SWEEP_INTERVAL` writes
//! a sweep removes the ones nothing touches again (finished fixed windows).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use crate::rate_limit::store::{glob_match, Clock, Store, StoreError, SystemClock};

/// Writes between sweeps of expired keys.
const SWEEP_INTERVAL: u64 = 256;

#[derive(Debug)]
enum Value {
    Counter(u64),
    /// (score, member), kept sorted by score.
    SortedSet(Vec<(f64, String)>),
    Hash(HashMap<String, String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<f64>,
}

impl Entry {
    fn is_expired(&self, now: f64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// DashMap-backed store with TTL expiry driven by a `Clock`.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys held in memory, expired or not.
    pub fn stored_len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every expired key.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Count a write and sweep on every `SWEEP_INTERVAL`th. Must not be
    /// called while holding a map reference.
    fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_INTERVAL == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, remaining = self.entries.len(), "Swept expired rate limit keys");
            }
        }
    }

    /// Entry for `key` with expired values dropped first.
    fn live_entry(&self, key: &str, now: f64) -> MapEntry<'_, String, Entry> {
        let entry = self.entries.entry(key.to_string());
        match entry {
            MapEntry::Occupied(occupied) if occupied.get().is_expired(now) => {
                occupied.remove();
                self.entries.entry(key.to_string())
            }
            other => other,
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType { key: key.to_string() }
}

#[async_trait]
impl Store for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.note_write();
        let now = self.clock.now();
        match self.live_entry(key, now) {
            MapEntry::Occupied(mut occupied) => match &mut occupied.get_mut().value {
                Value::Counter(count) => {
                    *count += 1;
                    Ok(*count)
                }
                _ => Err(wrong_type(key)),
            },
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value: Value::Counter(1),
                    expires_at: Some(now + ttl.as_secs_f64()),
                });
                Ok(1)
            }
        }
    }

    async fn sliding_window_push(
        &self,
        key: &str,
        window_start: f64,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        self.note_write();
        let now = self.clock.now();
        let mut entry = self.live_entry(key, now).or_insert_with(|| Entry {
            value: Value::SortedSet(Vec::new()),
            expires_at: None,
        });

        let Value::SortedSet(members) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        members.retain(|(s, _)| *s > window_start);
        let count = members.len() as u64;

        members.retain(|(_, m)| m != member);
        let pos = members.partition_point(|(s, _)| *s <= score);
        members.insert(pos, (score, member.to_string()));

        entry.expires_at = Some(now + ttl.as_secs_f64());
        Ok(count)
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            match &mut entry.value {
                Value::SortedSet(members) => members.retain(|(_, m)| m != member),
                _ => return Err(wrong_type(key)),
            }
        }
        Ok(())
    }

    async fn sorted_set_oldest(&self, key: &str) -> Result<Option<f64>, StoreError> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::SortedSet(members) => Ok(members.first().map(|(s, _)| *s)),
                _ => Err(wrong_type(key)),
            },
            _ => Ok(None),
        }
    }

    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::Hash(map) => Ok(fields.iter().map(|f| map.get(*f).cloned()).collect()),
                _ => Err(wrong_type(key)),
            },
            _ => Ok(vec![None; fields.len()]),
        }
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)], ttl: Duration) -> Result<(), StoreError> {
        self.note_write();
        let now = self.clock.now();
        let mut entry = self.live_entry(key, now).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });

        let Value::Hash(map) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        for (field, value) in fields {
            map.insert((*field).to_string(), value.clone());
        }
        entry.expires_at = Some(now + ttl.as_secs_f64());
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let deleted = keys
            .iter()
            .filter_map(|k| self.entries.remove(k))
            .filter(|(_, e)| !e.is_expired(now))
            .count();
        Ok(deleted as u64)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.is_expired(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::store::ManualClock;

    fn store() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1000.0));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_counter_ttl_set_on_first_increment_only() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(10);

        assert_eq!(store.increment("c", ttl).await.unwrap(), 1);
        clock.advance(Duration::from_secs(6));
        assert_eq!(store.increment("c", ttl).await.unwrap(), 2);

        // Expiry is still measured from the first increment
        clock.advance(Duration::from_secs(4));
        assert_eq!(store.increment("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sliding_window_push_counts_before_add() {
        let (store, _) = store();
        let ttl = Duration::from_secs(1);

        assert_eq!(store.sliding_window_push("s", 0.0, "a", 1.0, ttl).await.unwrap(), 0);
        assert_eq!(store.sliding_window_push("s", 0.0, "b", 2.0, ttl).await.unwrap(), 1);
        // Window start at 1.0 trims "a"
        assert_eq!(store.sliding_window_push("s", 1.0, "c", 3.0, ttl).await.unwrap(), 1);
        assert_eq!(store.sorted_set_oldest("s").await.unwrap(), Some(2.0));

        store.sorted_set_remove("s", "b").await.unwrap();
        assert_eq!(store.sorted_set_oldest("s").await.unwrap(), Some(3.0));
    }

    #[tokio::test]
    async fn test_hash_and_wrong_type() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(2);

        store
            .hash_set("h", &[("tokens", "4.5".into()), ("last_refill", "1000".into())], ttl)
            .await
            .unwrap();
        let values = store.hash_get("h", &["tokens", "missing"]).await.unwrap();
        assert_eq!(values, vec![Some("4.5".to_string()), None]);

        assert!(matches!(
            store.increment("h", ttl).await,
            Err(StoreError::WrongType { .. })
        ));

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.hash_get("h", &["tokens"]).await.unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_keys_and_delete() {
        let (store, _) = store();
        let ttl = Duration::from_secs(60);
        store.increment("rl:user:fixed:60", ttl).await.unwrap();
        store.increment("rl:user:fixed:120", ttl).await.unwrap();
        store.increment("rl:other:fixed:60", ttl).await.unwrap();

        let mut keys = store.keys("rl:user:fixed:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["rl:user:fixed:120", "rl:user:fixed:60"]);

        assert_eq!(store.delete(&keys).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_finished_windows_are_swept() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(1);

        // A fresh key per window, as the fixed-window limiter writes them
        for window in 0..1000 {
            store.increment(&format!("rl:user:fixed:{}", window), ttl).await.unwrap();
            clock.advance(Duration::from_secs(2));
        }

        assert_eq!(store.len(), 0);
        assert!(
            store.stored_len() <= SWEEP_INTERVAL as usize,
            "{} entries kept",
            store.stored_len()
        );

        store.purge_expired();
        assert_eq!(store.stored_len(), 0);
    }
}
