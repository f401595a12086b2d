//! Host-facing adapter: lifecycle callbacks plus an admin surface
//!
//! The two lifecycle callbacks never return errors. Any failure inside them
//! (store errors, timeouts, key derivation) degrades to "no caching" for that
//! call, and the host's tool runs as if the cache were absent.

use crate::cache::{
    config::CacheConfig,
    correlator::{InvocationCorrelator, PendingLookup},
    entry::CacheEntry,
    invalidation::{InvalidationEngine, InvalidationMap},
    keys::{derive_key, truncate_key},
    policy::{CachePolicy, PolicyOverride, PolicyRegistry},
    store::{with_timeout, CacheStore, MemoryStore},
    types::{CacheStats, CacheValue},
};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Trace target for per-call cache decisions
pub const TRACE_TARGET: &str = "toolcache::trace";

const TRACE_KEY_CHARS: usize = 24;

/// Substrings that mark a textual tool result as a failure
const ERROR_MARKERS: &[&str] = &[
    "error:",
    "Error:",
    "ERROR:",
    "Traceback",
    "Exception",
    "command not found",
    "No such file or directory",
    "Permission denied",
];

/// Result of a before-invocation lookup
#[derive(Debug, Clone, PartialEq)]
pub struct LookupOutcome {
    /// Whether the value came from the cache
    pub cached: bool,

    /// Cached result on a hit
    pub value: Option<CacheValue>,
}

impl LookupOutcome {
    pub fn miss() -> Self {
        Self {
            cached: false,
            value: None,
        }
    }

    pub fn hit(value: CacheValue) -> Self {
        Self {
            cached: true,
            value: Some(value),
        }
    }
}

/// Caller overrides loadable from a JSON file
///
/// ```json
/// {
///   "policies": { "Read": { "ttl_secs": 60 } },
///   "invalidation": { "Bash": ["Read", "Glob", "Grep"] }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterOverrides {
    pub policies: HashMap<String, PolicyOverride>,
    pub invalidation: HashMap<String, BTreeSet<String>>,
}

impl AdapterOverrides {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

/// Whether a result looks like a tool failure rather than data
pub fn looks_like_error(result: &Value) -> bool {
    match result {
        Value::String(text) => ERROR_MARKERS.iter().any(|m| text.contains(m)),
        Value::Object(map) => {
            map.get("is_error").and_then(Value::as_bool).unwrap_or(false)
                || map.get("error").map_or(false, |e| !e.is_null())
        }
        _ => false,
    }
}

/// Builder for [`ToolCacheAdapter`]
#[derive(Default)]
pub struct ToolCacheAdapterBuilder {
    config: Option<CacheConfig>,
    store: Option<Arc<dyn CacheStore>>,
    policy_table: Option<HashMap<String, CachePolicy>>,
    policy_overrides: HashMap<String, PolicyOverride>,
    invalidation_map: Option<InvalidationMap>,
    invalidation_overrides: HashMap<String, BTreeSet<String>>,
}

impl ToolCacheAdapterBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Back the adapter with `store` instead of a fresh [`MemoryStore`]
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the built-in policy table entirely
    pub fn policy_table(mut self, table: HashMap<String, CachePolicy>) -> Self {
        self.policy_table = Some(table);
        self
    }

    pub fn policy_override(mut self, operation: impl Into<String>, policy: PolicyOverride) -> Self {
        self.policy_overrides.insert(operation.into(), policy);
        self
    }

    /// Replace the built-in invalidation map entirely
    pub fn invalidation_map(mut self, map: InvalidationMap) -> Self {
        self.invalidation_map = Some(map);
        self
    }

    pub fn invalidation_override<I, S>(mut self, operation: impl Into<String>, affected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidation_overrides
            .insert(operation.into(), affected.into_iter().map(Into::into).collect());
        self
    }

    /// Merge file-level overrides
    pub fn overrides(mut self, overrides: AdapterOverrides) -> Self {
        self.policy_overrides.extend(overrides.policies);
        self.invalidation_overrides.extend(overrides.invalidation);
        self
    }

    /// Validate everything and build the adapter
    pub fn build(self) -> Result<ToolCacheAdapter> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let table = self.policy_table.unwrap_or_else(PolicyRegistry::default_table);
        let registry = PolicyRegistry::from_table(table, self.policy_overrides, &config)?;

        let map = self
            .invalidation_map
            .unwrap_or_else(InvalidationMap::defaults)
            .with_overrides(self.invalidation_overrides);
        let invalidation = InvalidationEngine::from_config(map, &config);

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::from_config(&config)));

        let correlator = InvocationCorrelator::new(config.pending_ttl, config.max_pending);

        debug!(
            "Tool cache adapter ready (store timeout {:?}, debug trace {})",
            config.store_timeout,
            if config.debug { "on" } else { "off" }
        );

        Ok(ToolCacheAdapter {
            config,
            store,
            registry,
            invalidation,
            correlator,
            generations: Mutex::new(HashMap::new()),
        })
    }
}

/// Caches results of idempotent operations and invalidates them after
/// mutations
pub struct ToolCacheAdapter {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    registry: PolicyRegistry,
    invalidation: InvalidationEngine,
    correlator: InvocationCorrelator,

    /// Per-operation count of invalidations seen by this process
    generations: Mutex<HashMap<String, u64>>,
}

impl ToolCacheAdapter {
    pub fn builder() -> ToolCacheAdapterBuilder {
        ToolCacheAdapterBuilder::default()
    }

    /// Adapter over an in-memory store with the built-in tables
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn CacheStore> {
        self.store.clone()
    }

    /// Look up a cached result before the operation runs.
    ///
    /// On a miss with a correlation id, the key is remembered so the matching
    /// [`after_invocation`](Self::after_invocation) can store the result.
    pub async fn before_invocation(
        &self,
        correlation_id: Option<&str>,
        operation: &str,
        input: &Value,
    ) -> LookupOutcome {
        let policy = match self.registry.resolve(operation) {
            Some(policy) if policy.admits(input) => policy,
            _ => {
                self.trace("skip", operation, "");
                return LookupOutcome::miss();
            }
        };

        let key = match derive_key(operation, input, &policy) {
            Ok(key) => key,
            Err(e) => {
                debug!("Not caching {}: {}", operation, e);
                self.trace("skip", operation, "");
                return LookupOutcome::miss();
            }
        };

        // Read before the lookup so a mutation finishing meanwhile is noticed
        let generation = self.generation(operation).await;

        match self.bounded("get", self.store.get(&key)).await {
            Ok(Some(entry)) => {
                self.trace("hit", operation, &key);
                return LookupOutcome::hit(entry.value);
            }
            Ok(None) => {}
            Err(e) => warn!("Cache lookup for {} degraded to a miss: {}", operation, e),
        }

        if let Some(id) = correlation_id {
            self.correlator
                .record_pending(id, key.clone(), operation, generation)
                .await;
        }
        self.trace("miss", operation, &key);
        LookupOutcome::miss()
    }

    /// Handle a completed operation: invalidate what it made stale, then
    /// store its result if a matching lookup missed.
    pub async fn after_invocation(
        &self,
        correlation_id: Option<&str>,
        operation: &str,
        input: &Value,
        result: &Value,
    ) {
        self.advance_generations(operation).await;

        if let Some(event) = self
            .invalidation
            .on_mutating_completion(operation, input, &self.registry, self.store.as_ref())
            .await
        {
            for key in &event.keys_deleted {
                self.trace("invalidate", operation, key);
            }
            if event.entries_cleared > 0 {
                self.trace("invalidate", operation, &format!("{} cleared", event.entries_cleared));
            }
        }

        let Some(id) = correlation_id else {
            return;
        };
        let Some(pending) = self.correlator.consume_pending(id).await else {
            return;
        };

        if pending.operation != operation {
            debug!(
                "Correlation id {} recorded {} but completed {}",
                id, pending.operation, operation
            );
            return;
        }

        let policy = match self.registry.resolve(operation) {
            Some(policy) if policy.admits(input) => policy,
            _ => return,
        };

        if let Some(reason) = self.unstorable_reason(result) {
            debug!("Not storing {} result: {}", operation, reason);
            self.trace("skip", operation, &pending.key);
            return;
        }

        if self.generation(operation).await != pending.generation {
            debug!("Not storing {} result: invalidated while it ran", operation);
            self.trace("skip", operation, &pending.key);
            return;
        }

        let ttl = self.config.ttl_with_jitter(policy.ttl);
        let mut entry = CacheEntry::new(pending.key.clone(), operation, result.clone(), ttl)
            .with_max_entries(policy.max_entries);
        if let Some(locator) = policy.locator_of(input) {
            entry = entry.with_locator(locator);
        }

        match self.bounded("set", self.store.set(&pending.key, entry)).await {
            Ok(()) => self.trace("store", operation, &pending.key),
            Err(e) => warn!("Failed to store {} result: {}", operation, e),
        }
    }

    fn unstorable_reason(&self, result: &Value) -> Option<&'static str> {
        let size = match result {
            Value::Null => return Some("empty result"),
            Value::String(text) if text.is_empty() => return Some("empty result"),
            Value::String(text) => text.len(),
            other => other.to_string().len(),
        };

        if size > self.config.max_result_bytes {
            return Some("result too large");
        }

        if self.config.skip_error_results && looks_like_error(result) {
            return Some("result looks like an error");
        }

        None
    }

    /// Store statistics
    pub async fn stats(&self) -> Result<CacheStats> {
        self.bounded("stats", self.store.stats()).await
    }

    /// Clear one operation's entries, or everything
    pub async fn clear(&self, operation: Option<&str>) -> Result<usize> {
        self.bounded("clear", self.store.clear(operation)).await
    }

    /// Remove a single key
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        self.bounded("delete", self.store.delete(key)).await
    }

    /// Remove, for every operation with a locator field, the entries it
    /// read from `locator`
    pub async fn invalidate_by_locator(&self, locator: &str) -> Result<usize> {
        let mut removed = 0;

        for (operation, policy) in self.registry.iter() {
            if policy.locator_field.is_none() || !policy.is_cacheable() {
                continue;
            }

            let keys = self
                .bounded("delete", self.store.delete_by_locator(operation, locator))
                .await?;
            for key in &keys {
                self.trace("invalidate", operation, key);
            }
            removed += keys.len();
        }

        Ok(removed)
    }

    /// Effective policy for an operation
    pub fn policy(&self, operation: &str) -> Option<Arc<CachePolicy>> {
        self.registry.resolve(operation)
    }

    /// Drop expired entries and orphaned pending lookups
    pub async fn evict_expired(&self) -> Result<usize> {
        let orphaned = self.correlator.sweep_stale().await;
        if orphaned > 0 {
            debug!("Dropped {} orphaned pending lookups", orphaned);
        }
        self.bounded("evict_expired", self.store.evict_expired()).await
    }

    pub async fn pending_count(&self) -> usize {
        self.correlator.len().await
    }

    /// Detach a pending lookup, e.g. to persist it across processes
    pub async fn take_pending(&self, correlation_id: &str) -> Option<PendingLookup> {
        self.correlator.consume_pending(correlation_id).await
    }

    /// Re-attach a lookup detached by [`take_pending`](Self::take_pending)
    pub async fn restore_pending(&self, correlation_id: &str, lookup: PendingLookup) {
        self.correlator.restore(correlation_id, lookup).await;
    }

    async fn generation(&self, operation: &str) -> u64 {
        self.generations.lock().await.get(operation).copied().unwrap_or(0)
    }

    /// Mark every operation `mutation` invalidates as changed, so lookups
    /// that started before it do not store their results
    async fn advance_generations(&self, mutation: &str) {
        let Some(affected) = self.invalidation.map().affected(mutation) else {
            return;
        };
        let mut generations = self.generations.lock().await;
        for operation in affected {
            *generations.entry(operation.clone()).or_insert(0) += 1;
        }
    }

    async fn bounded<T>(&self, context: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        with_timeout(self.config.store_timeout, context, call).await
    }

    fn trace(&self, outcome: &str, operation: &str, key: &str) {
        if self.config.debug {
            debug!(
                target: TRACE_TARGET,
                operation = operation,
                key = truncate_key(key, TRACE_KEY_CHARS),
                outcome = outcome,
                "cache {}",
                outcome
            );
        }
    }
}
