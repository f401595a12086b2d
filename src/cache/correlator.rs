//! Pairs a before-invocation miss with its after-invocation completion
//!
//! A correlation id moves `NotSeen -> Pending -> Resolved` (miss) or
//! `NotSeen -> Resolved` (hit, nothing recorded). Consuming removes the entry,
//! so a result can be stored at most once per id.

use crate::cache::types::CacheKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A recorded miss awaiting its result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingLookup {
    /// Key computed at lookup time
    pub key: CacheKey,

    /// Operation that missed
    pub operation: String,

    /// When the lookup was recorded
    pub started_at: DateTime<Utc>,

    /// Invalidation generation of the operation at lookup time
    #[serde(default)]
    pub generation: u64,
}

impl PendingLookup {
    pub fn new(key: impl Into<CacheKey>, operation: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operation: operation.into(),
            started_at: Utc::now(),
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now - self.started_at > max_age,
            Err(_) => false,
        }
    }
}

/// Bounded table of pending lookups keyed by correlation id
#[derive(Debug)]
pub struct InvocationCorrelator {
    pending: Mutex<HashMap<String, PendingLookup>>,
    pending_ttl: Duration,
    max_pending: usize,
}

impl InvocationCorrelator {
    pub fn new(pending_ttl: Duration, max_pending: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            pending_ttl,
            max_pending: max_pending.max(1),
        }
    }

    /// Record a miss seen at invalidation `generation`. A reused id
    /// overwrites the earlier lookup.
    pub async fn record_pending(
        &self,
        correlation_id: &str,
        key: CacheKey,
        operation: &str,
        generation: u64,
    ) {
        let lookup = PendingLookup::new(key, operation).with_generation(generation);
        self.restore(correlation_id, lookup).await;
    }

    /// Put back a lookup recorded elsewhere (e.g. by another process)
    pub async fn restore(&self, correlation_id: &str, lookup: PendingLookup) {
        let mut pending = self.pending.lock().await;

        if !pending.contains_key(correlation_id) && pending.len() >= self.max_pending {
            let swept = Self::sweep_locked(&mut pending, self.pending_ttl);
            if swept > 0 {
                debug!("Dropped {} stale pending lookups", swept);
            }

            if pending.len() >= self.max_pending {
                let oldest = pending
                    .iter()
                    .min_by_key(|(_, p)| p.started_at)
                    .map(|(id, _)| id.clone());
                if let Some(id) = oldest {
                    warn!("Pending table full, dropping lookup for {}", id);
                    pending.remove(&id);
                }
            }
        }

        pending.insert(correlation_id.to_string(), lookup);
    }

    /// Remove and return the lookup for `correlation_id`, if any
    pub async fn consume_pending(&self, correlation_id: &str) -> Option<PendingLookup> {
        self.pending.lock().await.remove(correlation_id)
    }

    /// Drop lookups older than the pending TTL
    pub async fn sweep_stale(&self) -> usize {
        let mut pending = self.pending.lock().await;
        Self::sweep_locked(&mut pending, self.pending_ttl)
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    fn sweep_locked(pending: &mut HashMap<String, PendingLookup>, max_age: Duration) -> usize {
        let now = Utc::now();
        let before = pending.len();
        pending.retain(|_, p| !p.is_stale(now, max_age));
        before - pending.len()
    }
}
