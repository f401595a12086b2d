//! File-backed cache store
//!
//! One JSON document per entry under `{root}/entries/`, named by the FNV-1a
//! digest of the key. Writes go to a temporary file and are renamed into
//! place, so concurrent readers in other processes never observe a partial
//! entry. Hit and miss counters are kept per process.

use crate::cache::{
    config::CacheConfig,
    entry::CacheEntry,
    keys::digest,
    store::CacheStore,
    types::{CacheKey, CacheStats},
};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ENTRIES_DIR: &str = "entries";

/// Persistent store shared by short-lived hook processes
pub struct FileStore {
    entries_dir: PathBuf,
    max_size_bytes: usize,
    max_entries: usize,

    /// Per-process counters; entry_count and total_bytes are computed on demand
    counters: Mutex<CacheStats>,

    /// Serializes mutations issued from this process
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(
        root: impl AsRef<Path>,
        max_size_bytes: usize,
        max_entries: usize,
    ) -> Result<Self> {
        let entries_dir = root.as_ref().join(ENTRIES_DIR);
        fs::create_dir_all(&entries_dir).await?;

        debug!("Opened file store at {}", entries_dir.display());

        Ok(Self {
            entries_dir,
            max_size_bytes,
            max_entries,
            counters: Mutex::new(CacheStats::default()),
            write_lock: Mutex::new(()),
        })
    }

    /// Open a store using the limits in `config`
    pub async fn from_config(root: impl AsRef<Path>, config: &CacheConfig) -> Result<Self> {
        Self::open(root, config.max_size_bytes, config.max_entries).await
    }

    /// Directory holding the entry files
    pub fn entries_dir(&self) -> &Path {
        &self.entries_dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.entries_dir.join(format!("{}.json", digest(key)))
    }

    /// Read one entry file. Missing files are `None`; unreadable ones are
    /// removed and also read as `None`.
    async fn read_entry(&self, path: &Path) -> Result<Option<CacheEntry>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Removing corrupt cache file {}: {}", path.display(), e);
                remove_if_present(path).await?;
                Ok(None)
            }
        }
    }

    fn temp_path(&self) -> PathBuf {
        self.entries_dir.join(format!(".{}.tmp", Uuid::new_v4()))
    }

    async fn write_entry(&self, path: &Path, entry: &CacheEntry) -> Result<()> {
        let body = serde_json::to_vec(entry)?;
        let tmp = self.temp_path();

        fs::write(&tmp, &body).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Write back access metadata for `entry`. Nothing is written when the
    /// file was removed or replaced since `entry` was read; returns whether
    /// the write happened.
    async fn touch_entry(&self, path: &Path, entry: &CacheEntry) -> Result<bool> {
        let body = serde_json::to_vec(entry)?;
        let tmp = self.temp_path();
        fs::write(&tmp, &body).await?;

        let unchanged = match self.read_entry(path).await {
            Ok(Some(current)) => current.key == entry.key && current.stored_at == entry.stored_at,
            Ok(None) => false,
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
        };
        if !unchanged {
            let _ = fs::remove_file(&tmp).await;
            return Ok(false);
        }

        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(true)
    }

    /// Every readable entry with its path
    async fn load_all(&self) -> Result<Vec<(PathBuf, CacheEntry)>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.entries_dir).await?;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(entry) = self.read_entry(&path).await? {
                entries.push((path, entry));
            }
        }

        Ok(entries)
    }

    /// Remove the least recently accessed entries matching `select` until
    /// `done` reports the remaining set is acceptable. Returns the count removed.
    async fn evict_lru<S, D>(
        &self,
        entries: &mut Vec<(PathBuf, CacheEntry)>,
        select: S,
        mut done: D,
    ) -> Result<u64>
    where
        S: Fn(&CacheEntry) -> bool,
        D: FnMut(&[(PathBuf, CacheEntry)]) -> bool,
    {
        entries.sort_by_key(|(_, e)| e.accessed_at);
        let mut evicted = 0;

        while !done(entries.as_slice()) {
            let Some(idx) = entries.iter().position(|(_, e)| select(e)) else {
                break;
            };
            let (path, victim) = entries.remove(idx);
            debug!("Evicting {} from file store", victim.key);
            remove_if_present(&path).await?;
            evicted += 1;
        }

        Ok(evicted)
    }
}

async fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CacheStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(key);

        // Held across the read and the access write-back, so a delete from
        // this process cannot land in between and be undone
        let _guard = self.write_lock.lock().await;

        let entry = match self.read_entry(&path).await? {
            Some(entry) if entry.key == key => entry,
            _ => {
                self.counters.lock().await.miss_count += 1;
                return Ok(None);
            }
        };

        if entry.is_expired() {
            debug!("Cache entry expired: {}", key);
            remove_if_present(&path).await?;
            let mut counters = self.counters.lock().await;
            counters.miss_count += 1;
            counters.evictions_ttl += 1;
            return Ok(None);
        }

        let mut entry = entry;
        entry.mark_accessed();
        match self.touch_entry(&path, &entry).await {
            Ok(true) => {}
            Ok(false) => {
                // Another process invalidated it after our read
                debug!("Cache entry {} removed during lookup", key);
                self.counters.lock().await.miss_count += 1;
                return Ok(None);
            }
            Err(e) => warn!("Failed to record access for {}: {}", key, e),
        }

        self.counters.lock().await.hit_count += 1;
        Ok(Some(entry))
    }

    async fn set(&self, key: &str, mut entry: CacheEntry) -> Result<()> {
        entry.key = key.to_string();
        entry.size_bytes = entry.calculate_size();

        if entry.size_bytes > self.max_size_bytes {
            return Err(CacheError::StoreError(format!(
                "entry of {} bytes exceeds store budget of {} bytes",
                entry.size_bytes, self.max_size_bytes
            )));
        }

        let _guard = self.write_lock.lock().await;
        let path = self.entry_path(key);

        let mut existing: Vec<(PathBuf, CacheEntry)> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|(p, _)| *p != path)
            .collect();

        let mut evicted = 0;

        if let Some(cap) = entry.max_entries {
            let op = entry.operation.clone();
            evicted += self
                .evict_lru(
                    &mut existing,
                    |e| e.operation == op,
                    |rest| rest.iter().filter(|(_, e)| e.operation == op).count() < cap,
                )
                .await?;
        }

        let max_entries = self.max_entries;
        evicted += self
            .evict_lru(&mut existing, |_| true, |rest| rest.len() < max_entries)
            .await?;

        let budget = self.max_size_bytes - entry.size_bytes;
        evicted += self
            .evict_lru(
                &mut existing,
                |_| true,
                |rest| rest.iter().map(|(_, e)| e.size_bytes).sum::<usize>() <= budget,
            )
            .await?;

        self.write_entry(&path, &entry).await?;

        if evicted > 0 {
            self.counters.lock().await.evictions_size += evicted;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.entry_path(key);

        let removed = match self.read_entry(&path).await? {
            Some(entry) if entry.key == key => remove_if_present(&path).await?,
            _ => false,
        };

        if removed {
            self.counters.lock().await.invalidations += 1;
            debug!("Removed cache entry: {}", key);
        }
        Ok(removed)
    }

    async fn delete_by_locator(&self, operation: &str, locator: &str) -> Result<Vec<CacheKey>> {
        let _guard = self.write_lock.lock().await;

        let mut removed = Vec::new();
        for (path, entry) in self.load_all().await? {
            if entry.matches_locator(operation, locator) && remove_if_present(&path).await? {
                removed.push(entry.key);
            }
        }

        if !removed.is_empty() {
            self.counters.lock().await.invalidations += removed.len() as u64;
            debug!("Removed {} {} entries for {}", removed.len(), operation, locator);
        }
        Ok(removed)
    }

    async fn clear(&self, operation: Option<&str>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let mut count = 0;
        for (path, entry) in self.load_all().await? {
            if operation.map_or(true, |op| entry.operation == op) && remove_if_present(&path).await? {
                count += 1;
            }
        }

        self.counters.lock().await.invalidations += count as u64;
        info!(
            "Cleared {} entries from file store ({})",
            count,
            operation.unwrap_or("all operations")
        );
        Ok(count)
    }

    async fn stats(&self) -> Result<CacheStats> {
        let entries = self.load_all().await?;
        let mut stats = self.counters.lock().await.clone();
        stats.entry_count = entries.len();
        stats.total_bytes = entries.iter().map(|(_, e)| e.size_bytes).sum();
        Ok(stats)
    }

    async fn evict_expired(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        let mut count = 0;
        for (path, entry) in self.load_all().await? {
            if entry.is_expired_at(now) && remove_if_present(&path).await? {
                count += 1;
            }
        }

        if count > 0 {
            self.counters.lock().await.evictions_ttl += count as u64;
            debug!("Cleaned up {} expired entries", count);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(op: &str, key: &str, value: &str) -> CacheEntry {
        CacheEntry::new(key, op, json!(value), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_set_get_persists_across_instances() {
        let dir = TempDir::new().unwrap();

        let store = FileStore::open(dir.path(), 1024 * 1024, 100).await.unwrap();
        store.set("Read:1", entry("Read", "Read:1", "contents")).await.unwrap();

        let reopened = FileStore::open(dir.path(), 1024 * 1024, 100).await.unwrap();
        let hit = reopened.get("Read:1").await.unwrap().unwrap();
        assert_eq!(hit.value, json!("contents"));
        assert_eq!(hit.hit_count, 1);

        // Access metadata is written back
        let again = store.get("Read:1").await.unwrap().unwrap();
        assert_eq!(again.hit_count, 2);
    }

    #[tokio::test]
    async fn test_corrupt_file_reads_as_miss_and_is_removed() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), 1024 * 1024, 100).await.unwrap();

        let path = store.entry_path("Read:bad");
        fs::write(&path, b"{not json").await.unwrap();

        assert!(store.get("Read:bad").await.unwrap().is_none());
        assert!(!path.exists());
        assert_eq!(store.stats().await.unwrap().miss_count, 1);
    }

    #[tokio::test]
    async fn test_byte_budget_evicts_least_recently_accessed() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), 300, 100).await.unwrap();

        for i in 0..4 {
            let key = format!("Read:{}", i);
            store.set(&key, entry("Read", &key, &"x".repeat(80))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats = store.stats().await.unwrap();
        assert!(stats.total_bytes <= 300);
        assert!(stats.evictions_size > 0);
        assert!(store.get("Read:3").await.unwrap().is_some());
        assert!(store.get("Read:0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), 32, 100).await.unwrap();
        let err = store.set("k", entry("Read", "k", &"x".repeat(100))).await.unwrap_err();
        assert!(matches!(err, CacheError::StoreError(_)));
    }

    #[tokio::test]
    async fn test_per_operation_cap_and_scoped_clear() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), 1024 * 1024, 100).await.unwrap();

        for i in 0..3 {
            let key = format!("mcp__a__b:{}", i);
            store
                .set(&key, entry("mcp__a__b", &key, "v").with_max_entries(2))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        store.set("Glob:1", entry("Glob", "Glob:1", "v")).await.unwrap();

        assert_eq!(store.stats().await.unwrap().entry_count, 3);
        assert_eq!(store.clear(Some("mcp__a__b")).await.unwrap(), 2);
        assert_eq!(store.clear(None).await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_delete_and_evict_expired() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), 1024 * 1024, 100).await.unwrap();

        store.set("a", entry("Read", "a", "1")).await.unwrap();
        store
            .set("b", CacheEntry::new("b", "Read", json!("2"), Duration::from_millis(20)))
            .await
            .unwrap();

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.evict_expired().await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_delete_by_locator_spans_input_variants() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), 1024 * 1024, 100).await.unwrap();

        store
            .set("Read:whole", entry("Read", "Read:whole", "all").with_locator("/a"))
            .await
            .unwrap();
        store
            .set("Read:range", entry("Read", "Read:range", "some").with_locator("/a"))
            .await
            .unwrap();
        store
            .set("Read:b", entry("Read", "Read:b", "b").with_locator("/b"))
            .await
            .unwrap();

        let removed = store.delete_by_locator("Read", "/a").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.get("Read:range").await.unwrap().is_none());
        assert!(store.get("Read:b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_access_write_back_skips_replaced_entry() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), 1024 * 1024, 100).await.unwrap();
        let path = store.entry_path("k");

        store.set("k", entry("Read", "k", "old")).await.unwrap();
        let stale = store.read_entry(&path).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        store.set("k", entry("Read", "k", "new")).await.unwrap();
        assert!(!store.touch_entry(&path, &stale).await.unwrap());

        store.delete("k").await.unwrap();
        assert!(!store.touch_entry(&path, &stale).await.unwrap());
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_never_revives_deleted_entry() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path(), 1024 * 1024, 100).await.unwrap());

        for i in 0..100 {
            store.set("Read:k", entry("Read", "Read:k", &format!("v{}", i))).await.unwrap();

            let reader = {
                let store = store.clone();
                tokio::spawn(async move { store.get("Read:k").await })
            };
            let deleter = {
                let store = store.clone();
                tokio::spawn(async move { store.delete("Read:k").await })
            };

            reader.await.unwrap().unwrap();
            let deleted = deleter.await.unwrap().unwrap();

            assert!(deleted, "iteration {}: delete found nothing", i);
            assert!(
                store.get("Read:k").await.unwrap().is_none(),
                "iteration {}: entry came back after delete",
                i
            );
        }
    }
}
