//! Cache entry management with TTL support

use crate::cache::types::{CacheKey, CacheValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cached tool result with TTL and access metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cache key
    pub key: CacheKey,

    /// Operation whose result this is
    pub operation: String,

    /// When the entry was stored
    pub stored_at: DateTime<Utc>,

    /// Last hit (for LRU tracking)
    pub accessed_at: DateTime<Utc>,

    /// Time-to-live; zero never expires
    pub ttl: Duration,

    /// Number of cache hits served from this entry
    pub hit_count: u64,

    /// Approximate footprint in bytes
    pub size_bytes: usize,

    /// Per-operation population cap carried from the policy
    #[serde(default)]
    pub max_entries: Option<usize>,

    /// Resource the result was read from, e.g. a file path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,

    /// The cached value
    pub value: CacheValue,
}

impl CacheEntry {
    /// Create a new cache entry; size is computed eagerly
    pub fn new(
        key: impl Into<CacheKey>,
        operation: impl Into<String>,
        value: CacheValue,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let mut entry = Self {
            key: key.into(),
            operation: operation.into(),
            stored_at: now,
            accessed_at: now,
            ttl,
            hit_count: 0,
            size_bytes: 0,
            max_entries: None,
            locator: None,
            value,
        };
        entry.size_bytes = entry.calculate_size();
        entry
    }

    /// Attach a per-operation entry cap
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Scope the entry to one resource so narrow invalidation can find it
    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    /// Whether this entry belongs to `operation` and was read from `locator`
    pub fn matches_locator(&self, operation: &str, locator: &str) -> bool {
        self.operation == operation && self.locator.as_deref() == Some(locator)
    }

    /// Expiration instant, if the entry expires at all
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.ttl.is_zero() {
            return None;
        }
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.stored_at.checked_add_signed(ttl))
    }

    /// Check if the entry has expired (now - stored_at > ttl)
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub(crate) fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires_at) => now > expires_at,
            None => false,
        }
    }

    /// Record a cache hit
    pub fn mark_accessed(&mut self) {
        self.accessed_at = Utc::now();
        self.hit_count += 1;
    }

    /// Get the age of the entry
    pub fn age(&self) -> Duration {
        (Utc::now() - self.stored_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Approximate size: key + operation + serialized value
    pub fn calculate_size(&self) -> usize {
        self.key.len() + self.operation.len() + self.value.to_string().len()
    }
}
