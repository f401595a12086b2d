//! # Ouroboros Tool Cache (ouroboros-toolcache)
//!
//! Result caching and cross-tool invalidation for agent tool invocations.
//!
//! ## Features
//!
//! - Deterministic cache keys from tool inputs, independent of field order
//! - Per-tool policies with TTLs, entry caps and admission conditions
//! - Narrow invalidation by file path, broad invalidation by tool
//! - In-memory and file-backed stores behind an async trait
//! - Hook protocol types for hosts that run pre/post tool hooks as processes
//!
//! ## Usage
//!
//! ```no_run
//! use ouroboros_toolcache::{CacheConfig, FileStore, ToolCacheAdapter};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CacheConfig::from_env()?;
//!     let store = FileStore::from_config("/tmp/toolcache", &config).await?;
//!
//!     let adapter = ToolCacheAdapter::builder()
//!         .config(config)
//!         .store(Arc::new(store))
//!         .build()?;
//!
//!     let input = json!({"pattern": "**/*.rs"});
//!     let outcome = adapter.before_invocation(Some("toolu_01"), "Glob", &input).await;
//!     if !outcome.cached {
//!         let result = json!(["src/lib.rs", "src/main.rs"]);
//!         adapter.after_invocation(Some("toolu_01"), "Glob", &input, &result).await;
//!     }
//!
//!     println!("{}", adapter.stats().await?);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod hook;

// Re-export main types for convenience
pub use cache::{
    AdapterOverrides, CacheConfig, CacheConfigBuilder, CacheEntry, CacheKey, CachePolicy,
    CacheStats, CacheStore, CacheStrategy, CacheValue, FileStore, InvalidationEvent,
    InvalidationMap, LookupOutcome, MemoryStore, PolicyOverride, PolicyRegistry, ToolCacheAdapter,
};
pub use error::{CacheError, Result};
