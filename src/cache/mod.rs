//! # Tool Result Caching Layer
//!
//! Caches the results of idempotent tool invocations and invalidates them when
//! a mutating tool changes what they observed.
//!
//! ## Features
//!
//! - **Deterministic Keys**: canonical JSON of the relevant input fields, hashed with FNV-1a
//! - **Per-Operation Policies**: TTL, entry caps, excluded/key fields, admission conditions
//! - **Cross-Tool Invalidation**: narrow (one resource) or broad (whole operation)
//! - **Pluggable Stores**: in-memory LRU and file-backed stores behind one async trait
//! - **Fail-Soft**: store errors and timeouts degrade to a miss, never to a failed tool
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_toolcache::cache::{CacheConfig, ToolCacheAdapter};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let adapter = ToolCacheAdapter::new(CacheConfig::default())?;
//! let input = json!({"file_path": "/src/lib.rs"});
//!
//! // First call misses; the result is stored when the tool completes
//! let outcome = adapter.before_invocation(Some("call-1"), "Read", &input).await;
//! assert!(!outcome.cached);
//! adapter
//!     .after_invocation(Some("call-1"), "Read", &input, &json!("pub mod cache;"))
//!     .await;
//!
//! // Same input hits
//! let outcome = adapter.before_invocation(Some("call-2"), "Read", &input).await;
//! assert!(outcome.cached);
//!
//! // A write to the same file drops the cached read
//! adapter
//!     .after_invocation(Some("call-3"), "Write", &input, &json!("ok"))
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod correlator;
pub mod entry;
pub mod file_store;
pub mod invalidation;
pub mod keys;
pub mod policy;
pub mod store;
pub mod types;

pub use adapter::{AdapterOverrides, LookupOutcome, ToolCacheAdapter, ToolCacheAdapterBuilder};
pub use config::{CacheConfig, CacheConfigBuilder};
pub use correlator::{InvocationCorrelator, PendingLookup};
pub use entry::CacheEntry;
pub use file_store::FileStore;
pub use invalidation::{
    InvalidationAction, InvalidationEngine, InvalidationEvent, InvalidationMap, InvalidationScope,
};
pub use keys::derive_key;
pub use policy::{
    CacheCondition, CachePolicy, CacheStrategy, CustomKeyFn, PolicyOverride, PolicyRegistry,
};
pub use store::{CacheStore, MemoryStore};
pub use types::{CacheKey, CacheStats, CacheValue};
