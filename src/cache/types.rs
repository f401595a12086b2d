//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cache key type - `"{operation}:{digest}"`
pub type CacheKey = String;

/// Cached tool result - opaque JSON as delivered by the host
pub type CacheValue = serde_json::Value;

/// Statistics and metrics for cache performance monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CacheStats {
    /// Number of entries currently in the store
    pub entry_count: usize,

    /// Total size of cached data in bytes
    pub total_bytes: usize,

    /// Total number of cache hits
    pub hit_count: u64,

    /// Total number of cache misses
    pub miss_count: u64,

    /// Number of evictions due to byte budget or entry caps
    pub evictions_size: u64,

    /// Number of evictions due to TTL expiration
    pub evictions_ttl: u64,

    /// Number of explicit deletions and clears
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            (self.hit_count as f64 / total as f64) * 100.0
        }
    }

    /// Calculate total evictions
    pub fn total_evictions(&self) -> u64 {
        self.evictions_size + self.evictions_ttl
    }

    /// Average entry size in bytes
    pub fn avg_entry_size(&self) -> usize {
        if self.entry_count == 0 {
            0
        } else {
            self.total_bytes / self.entry_count
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ entries: {}, size: {} bytes, hits: {}, misses: {}, hit_rate: {:.2}%, evictions: {}, invalidations: {} }}",
            self.entry_count,
            self.total_bytes,
            self.hit_count,
            self.miss_count,
            self.hit_rate(),
            self.total_evictions(),
            self.invalidations
        )
    }
}
