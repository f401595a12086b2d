//! Cache store contract and the in-memory reference store
//!
//! Any conforming store (memory, disk, remote) can back the adapter. The
//! adapter treats every store error as a miss or a skipped write.

use crate::cache::{
    config::CacheConfig,
    entry::CacheEntry,
    types::{CacheKey, CacheStats},
};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Key-value store for cached tool results
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up an entry. Expired entries read as `None` and are evicted.
    /// A hit increments the entry's `hit_count`.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Insert or replace an entry, evicting others to stay within budget
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()>;

    /// Remove one entry; `true` if it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every entry of `operation` that was read from `locator`.
    /// Returns the keys removed.
    async fn delete_by_locator(&self, operation: &str, locator: &str) -> Result<Vec<CacheKey>>;

    /// Remove every entry for `operation`, or everything when `None`.
    /// Returns the number of entries removed.
    async fn clear(&self, operation: Option<&str>) -> Result<usize>;

    /// Aggregate statistics
    async fn stats(&self) -> Result<CacheStats>;

    /// Remove all expired entries; stores that only expire lazily may no-op
    async fn evict_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Run a store call under a time budget; overruns become `TimeoutError`
pub async fn with_timeout<T>(
    budget: Duration,
    context: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(budget, call)
        .await
        .map_err(|_| CacheError::TimeoutError {
            timeout_ms: budget.as_millis() as u64,
            context: context.to_string(),
        })?
}

/// In-memory store with LRU eviction under a byte budget
///
/// - Thread-safe async access via RwLock
/// - Lazy TTL expiration on read, plus an explicit sweep
/// - Global entry cap and per-operation caps carried by entries
pub struct MemoryStore {
    max_size_bytes: usize,
    max_entries: usize,
    inner: Arc<RwLock<MemoryInner>>,
}

/// Internal storage
#[derive(Default)]
struct MemoryInner {
    /// Main storage: key -> entry
    entries: HashMap<CacheKey, CacheEntry>,

    /// LRU tracking: front is least recently used
    lru_queue: VecDeque<CacheKey>,

    /// Running counters
    stats: CacheStats,

    /// Total size of cached data in bytes
    current_size_bytes: usize,
}

impl MemoryInner {
    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.lru_queue.retain(|k| k != key);
        self.current_size_bytes = self.current_size_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn touch(&mut self, key: &str) {
        self.lru_queue.retain(|k| k != key);
        self.lru_queue.push_back(key.to_string());
    }

    /// Least recently used key belonging to `operation`
    fn oldest_for(&self, operation: &str) -> Option<CacheKey> {
        self.lru_queue
            .iter()
            .find(|k| self.entries.get(k.as_str()).map_or(false, |e| e.operation == operation))
            .cloned()
    }

    fn count_for(&self, operation: &str) -> usize {
        self.entries.values().filter(|e| e.operation == operation).count()
    }
}

impl MemoryStore {
    /// Create a store with explicit limits
    pub fn new(max_size_bytes: usize, max_entries: usize) -> Self {
        debug!(
            "Initializing memory store (max {} bytes, {} entries)",
            max_size_bytes, max_entries
        );

        Self {
            max_size_bytes,
            max_entries,
            inner: Arc::new(RwLock::new(MemoryInner::default())),
        }
    }

    /// Create a store using the limits in `config`
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size_bytes, config.max_entries)
    }

    /// Number of entries, expired or not
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// Check for a key without counting an access
    pub async fn contains_key(&self, key: &str) -> bool {
        self.inner.read().await.entries.contains_key(key)
    }

    /// Evict until `entry` fits. `key` is the slot being replaced, if any.
    fn make_room(&self, inner: &mut MemoryInner, key: &str, entry: &CacheEntry) -> Result<()> {
        if entry.size_bytes > self.max_size_bytes {
            warn!(
                "Entry {} ({} bytes) exceeds the store budget of {} bytes",
                key, entry.size_bytes, self.max_size_bytes
            );
            return Err(CacheError::StoreError(format!(
                "entry of {} bytes exceeds store budget of {} bytes",
                entry.size_bytes, self.max_size_bytes
            )));
        }

        // Per-operation cap
        if let Some(cap) = entry.max_entries {
            while inner.count_for(&entry.operation) >= cap {
                match inner.oldest_for(&entry.operation) {
                    Some(victim) => {
                        debug!("Evicting {} due to {} entry cap", victim, entry.operation);
                        inner.remove_entry(&victim);
                        inner.stats.evictions_size += 1;
                    }
                    None => break,
                }
            }
        }

        // Global entry cap
        while inner.entries.len() >= self.max_entries {
            match inner.lru_queue.pop_front() {
                Some(victim) => {
                    debug!("Evicting entry due to max_entries limit: {}", victim);
                    inner.remove_entry(&victim);
                    inner.stats.evictions_size += 1;
                }
                None => break,
            }
        }

        // Byte budget
        while inner.current_size_bytes + entry.size_bytes > self.max_size_bytes {
            match inner.lru_queue.pop_front() {
                Some(victim) => {
                    debug!("Evicting entry due to size limit: {}", victim);
                    inner.remove_entry(&victim);
                    inner.stats.evictions_size += 1;
                }
                None => break,
            }
        }

        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut inner = self.inner.write().await;

        let expired = match inner.entries.get(key) {
            None => {
                inner.stats.miss_count += 1;
                return Ok(None);
            }
            Some(entry) => entry.is_expired(),
        };

        if expired {
            debug!("Cache entry expired: {}", key);
            inner.remove_entry(key);
            inner.stats.miss_count += 1;
            inner.stats.evictions_ttl += 1;
            return Ok(None);
        }

        let hit = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.mark_accessed();
                entry.clone()
            }
            None => return Ok(None),
        };
        inner.touch(key);
        inner.stats.hit_count += 1;

        Ok(Some(hit))
    }

    async fn set(&self, key: &str, mut entry: CacheEntry) -> Result<()> {
        entry.key = key.to_string();
        entry.size_bytes = entry.calculate_size();

        let mut inner = self.inner.write().await;

        // Replacing an entry frees its slot first
        inner.remove_entry(key);
        self.make_room(&mut inner, key, &entry)?;

        inner.current_size_bytes += entry.size_bytes;
        inner.entries.insert(key.to_string(), entry);
        inner.lru_queue.push_back(key.to_string());

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let removed = inner.remove_entry(key).is_some();
        if removed {
            inner.stats.invalidations += 1;
            debug!("Removed cache entry: {}", key);
        }
        Ok(removed)
    }

    async fn delete_by_locator(&self, operation: &str, locator: &str) -> Result<Vec<CacheKey>> {
        let mut inner = self.inner.write().await;

        let keys: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.matches_locator(operation, locator))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            inner.remove_entry(key);
        }
        inner.stats.invalidations += keys.len() as u64;

        if !keys.is_empty() {
            debug!("Removed {} {} entries for {}", keys.len(), operation, locator);
        }
        Ok(keys)
    }

    async fn clear(&self, operation: Option<&str>) -> Result<usize> {
        let mut inner = self.inner.write().await;

        let count = match operation {
            None => {
                let count = inner.entries.len();
                inner.entries.clear();
                inner.lru_queue.clear();
                inner.current_size_bytes = 0;
                count
            }
            Some(op) => {
                let keys: Vec<CacheKey> = inner
                    .entries
                    .iter()
                    .filter(|(_, e)| e.operation == op)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in &keys {
                    inner.remove_entry(key);
                }
                keys.len()
            }
        };

        inner.stats.invalidations += count as u64;
        info!(
            "Cleared {} entries from memory store ({})",
            count,
            operation.unwrap_or("all operations")
        );
        Ok(count)
    }

    async fn stats(&self) -> Result<CacheStats> {
        let inner = self.inner.read().await;
        let mut stats = inner.stats.clone();
        stats.entry_count = inner.entries.len();
        stats.total_bytes = inner.current_size_bytes;
        Ok(stats)
    }

    async fn evict_expired(&self) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            inner.remove_entry(key);
        }
        inner.stats.evictions_ttl += expired.len() as u64;

        if !expired.is_empty() {
            debug!("Cleaned up {} expired entries", expired.len());
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn entry(op: &str, key: &str, value: &str) -> CacheEntry {
        CacheEntry::new(key, op, json!(value), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_basic_set_and_get() {
        let store = MemoryStore::new(1024 * 1024, 100);

        store.set("Read:1", entry("Read", "Read:1", "hello")).await.unwrap();

        let hit = store.get("Read:1").await.unwrap().unwrap();
        assert_eq!(hit.value, json!("hello"));
        assert_eq!(hit.hit_count, 1);

        let again = store.get("Read:1").await.unwrap().unwrap();
        assert_eq!(again.hit_count, 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 0);
        assert_eq!(stats.entry_count, 1);
        assert!(stats.total_bytes > 0);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let store = MemoryStore::from_config(&CacheConfig::default());

        assert!(store.get("nonexistent").await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().miss_count, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiration_is_lazy_miss() {
        let store = MemoryStore::new(1024 * 1024, 100);
        let short = CacheEntry::new("Read:1", "Read", json!("v"), Duration::from_millis(50));
        store.set("Read:1", short).await.unwrap();

        assert!(store.get("Read:1").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.get("Read:1").await.unwrap().is_none());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.evictions_ttl, 1);
        assert_eq!(stats.entry_count, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_by_entry_count() {
        let store = MemoryStore::new(1024 * 1024, 3);

        store.set("k1", entry("Read", "k1", "v1")).await.unwrap();
        store.set("k2", entry("Read", "k2", "v2")).await.unwrap();
        store.set("k3", entry("Read", "k3", "v3")).await.unwrap();

        // Touch k1 so k2 becomes least recently used
        store.get("k1").await.unwrap();
        store.set("k4", entry("Read", "k4", "v4")).await.unwrap();

        assert!(!store.contains_key("k2").await);
        assert!(store.contains_key("k1").await);
        assert!(store.contains_key("k4").await);
        assert!(store.stats().await.unwrap().evictions_size > 0);
    }

    #[tokio::test]
    async fn test_byte_budget_bounds_total_size() {
        let store = MemoryStore::new(400, 1000);

        for i in 0..10 {
            let key = format!("Read:{}", i);
            store.set(&key, entry("Read", &key, &"x".repeat(100))).await.unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert!(stats.total_bytes <= 400);
        assert!(stats.entry_count < 10);
        // Most recent insert survives
        assert!(store.contains_key("Read:9").await);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_rejected() {
        let store = MemoryStore::new(64, 10);
        let result = store.set("big", entry("Read", "big", &"x".repeat(200))).await;
        assert!(matches!(result, Err(CacheError::StoreError(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_replacing_entry_does_not_leak_bytes() {
        let store = MemoryStore::new(1024 * 1024, 100);
        store.set("k", entry("Read", "k", "aaaa")).await.unwrap();
        let before = store.stats().await.unwrap().total_bytes;
        store.set("k", entry("Read", "k", "bbbb")).await.unwrap();
        let after = store.stats().await.unwrap();
        assert_eq!(after.total_bytes, before);
        assert_eq!(after.entry_count, 1);
    }

    #[tokio::test]
    async fn test_per_operation_cap() {
        let store = MemoryStore::new(1024 * 1024, 100);

        for i in 0..3 {
            let key = format!("mcp__x__y:{}", i);
            let e = entry("mcp__x__y", &key, "v").with_max_entries(2);
            store.set(&key, e).await.unwrap();
        }
        store.set("Read:1", entry("Read", "Read:1", "v")).await.unwrap();

        assert!(!store.contains_key("mcp__x__y:0").await);
        assert!(store.contains_key("mcp__x__y:1").await);
        assert!(store.contains_key("mcp__x__y:2").await);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_delete_and_scoped_clear() {
        let store = MemoryStore::new(1024 * 1024, 100);
        store.set("Read:1", entry("Read", "Read:1", "a")).await.unwrap();
        store.set("Read:2", entry("Read", "Read:2", "b")).await.unwrap();
        store.set("Glob:1", entry("Glob", "Glob:1", "c")).await.unwrap();

        assert!(store.delete("Read:1").await.unwrap());
        assert!(!store.delete("Read:1").await.unwrap());

        assert_eq!(store.clear(Some("Glob")).await.unwrap(), 1);
        assert!(store.contains_key("Read:2").await);

        assert_eq!(store.clear(None).await.unwrap(), 1);
        assert!(store.is_empty().await);
        assert_eq!(store.stats().await.unwrap().total_bytes, 0);
    }

    #[tokio::test]
    async fn test_delete_by_locator_reaches_every_variant() {
        let store = MemoryStore::new(1024 * 1024, 100);
        let scoped = |key: &str, path: &str| entry("Read", key, "v").with_locator(path);

        store.set("Read:whole", scoped("Read:whole", "/a")).await.unwrap();
        store.set("Read:range", scoped("Read:range", "/a")).await.unwrap();
        store.set("Read:other", scoped("Read:other", "/b")).await.unwrap();
        store
            .set("Glob:1", entry("Glob", "Glob:1", "v").with_locator("/a"))
            .await
            .unwrap();

        let mut removed = store.delete_by_locator("Read", "/a").await.unwrap();
        removed.sort();
        assert_eq!(removed, vec!["Read:range".to_string(), "Read:whole".to_string()]);

        assert!(store.contains_key("Read:other").await);
        assert!(store.contains_key("Glob:1").await);
        assert_eq!(store.stats().await.unwrap().invalidations, 2);
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let store = MemoryStore::new(1024 * 1024, 100);
        store
            .set("a", CacheEntry::new("a", "Read", json!(1), Duration::from_millis(20)))
            .await
            .unwrap();
        store.set("b", entry("Read", "b", "keep")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.evict_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }
}
