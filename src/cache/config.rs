//! Configuration for the cache system

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Input fields that scope a mutation to a single resource, checked in order
pub const DEFAULT_LOCATOR_FIELDS: &[&str] = &["file_path", "notebook_path", "path"];

/// Namespace prefix for externally supplied (plugin/MCP) tools
pub const DEFAULT_PLUGIN_PREFIX: &str = "mcp__";

/// Configuration for the tool cache adapter and its reference stores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum total size of cached data in bytes
    pub max_size_bytes: usize,

    /// Maximum number of entries across all operations
    pub max_entries: usize,

    /// TTL jitter factor (0.0 - 1.0)
    /// Adds random variation to stored TTLs to spread expirations
    pub ttl_jitter: f64,

    /// Time budget for a single store call made from a lifecycle callback.
    /// A slower store degrades to a miss instead of stalling the tool.
    pub store_timeout: Duration,

    /// Results whose serialized form exceeds this are never stored
    pub max_result_bytes: usize,

    /// Skip results that look like tool errors
    pub skip_error_results: bool,

    /// Emit the hit/miss/store/invalidate trace channel
    pub debug: bool,

    /// Operations under this prefix get a synthesized policy
    pub plugin_prefix: String,

    /// TTL for synthesized plugin policies
    pub plugin_ttl: Duration,

    /// Entry cap for synthesized plugin policies
    pub plugin_max_entries: usize,

    /// Input fields recognized as resource locators, in priority order
    pub locator_fields: Vec<String>,

    /// Pending lookups older than this are considered orphaned
    pub pending_ttl: Duration,

    /// Upper bound on the pending lookup table
    pub max_pending: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            // 50 MB default
            max_size_bytes: 50 * 1024 * 1024,
            max_entries: 10_000,
            ttl_jitter: 0.0,
            store_timeout: Duration::from_millis(250),
            // 100 KB, larger results are not worth the space
            max_result_bytes: 100_000,
            skip_error_results: true,
            debug: false,
            plugin_prefix: DEFAULT_PLUGIN_PREFIX.to_string(),
            plugin_ttl: Duration::from_secs(60),
            plugin_max_entries: 100,
            locator_fields: DEFAULT_LOCATOR_FIELDS.iter().map(|s| s.to_string()).collect(),
            // Long-running shell commands can take up to ten minutes
            pending_ttl: Duration::from_secs(600),
            max_pending: 1024,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CacheError::ConfigError(
                "max_entries must be greater than 0".to_string(),
            ));
        }

        if self.max_size_bytes == 0 {
            return Err(CacheError::ConfigError(
                "max_size_bytes must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(CacheError::ConfigError(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.store_timeout.is_zero() {
            return Err(CacheError::ConfigError(
                "store_timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_pending == 0 {
            return Err(CacheError::ConfigError(
                "max_pending must be greater than 0".to_string(),
            ));
        }

        if self.plugin_prefix.is_empty() {
            return Err(CacheError::ConfigError(
                "plugin_prefix must not be empty".to_string(),
            ));
        }

        if self.locator_fields.iter().any(|f| f.is_empty()) {
            return Err(CacheError::ConfigError(
                "locator_fields must not contain empty names".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply jitter to a policy TTL. A zero TTL (never expires) is left alone.
    pub fn ttl_with_jitter(&self, ttl: Duration) -> Duration {
        if self.ttl_jitter == 0.0 || ttl.is_zero() {
            return ttl;
        }

        let base_secs = ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(1.0);

        Duration::from_secs_f64(final_secs)
    }

    /// Build a configuration from `TOOLCACHE_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("TOOLCACHE_MAX_BYTES") {
            config.max_size_bytes = parse_var("TOOLCACHE_MAX_BYTES", &v)?;
        }
        if let Some(v) = lookup("TOOLCACHE_MAX_ENTRIES") {
            config.max_entries = parse_var("TOOLCACHE_MAX_ENTRIES", &v)?;
        }
        if let Some(v) = lookup("TOOLCACHE_TTL_JITTER") {
            config.ttl_jitter = parse_var("TOOLCACHE_TTL_JITTER", &v)?;
        }
        if let Some(v) = lookup("TOOLCACHE_STORE_TIMEOUT_MS") {
            config.store_timeout =
                Duration::from_millis(parse_var("TOOLCACHE_STORE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("TOOLCACHE_MAX_RESULT_BYTES") {
            config.max_result_bytes = parse_var("TOOLCACHE_MAX_RESULT_BYTES", &v)?;
        }
        if let Some(v) = lookup("TOOLCACHE_SKIP_ERRORS") {
            config.skip_error_results = parse_flag("TOOLCACHE_SKIP_ERRORS", &v)?;
        }
        if let Some(v) = lookup("TOOLCACHE_DEBUG") {
            config.debug = parse_flag("TOOLCACHE_DEBUG", &v)?;
        }
        if let Some(v) = lookup("TOOLCACHE_PLUGIN_PREFIX") {
            config.plugin_prefix = v;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        CacheError::ConfigError(format!("{} has an invalid value: {:?}", name, value))
    })
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(CacheError::ConfigError(format!(
            "{} must be a boolean, got {:?}",
            name, value
        ))),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    max_size_bytes: Option<usize>,
    max_entries: Option<usize>,
    ttl_jitter: Option<f64>,
    store_timeout: Option<Duration>,
    max_result_bytes: Option<usize>,
    skip_error_results: Option<bool>,
    debug: Option<bool>,
    plugin_prefix: Option<String>,
    plugin_ttl: Option<Duration>,
    plugin_max_entries: Option<usize>,
    locator_fields: Option<Vec<String>>,
    pending_ttl: Option<Duration>,
    max_pending: Option<usize>,
}

impl CacheConfigBuilder {
    /// Set maximum cache size in bytes
    pub fn max_size_bytes(mut self, size: usize) -> Self {
        self.max_size_bytes = Some(size);
        self
    }

    /// Set maximum number of cache entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Set the per-call store time budget
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    /// Set the largest storable result
    pub fn max_result_bytes(mut self, size: usize) -> Self {
        self.max_result_bytes = Some(size);
        self
    }

    /// Enable or disable skipping of error-looking results
    pub fn skip_error_results(mut self, skip: bool) -> Self {
        self.skip_error_results = Some(skip);
        self
    }

    /// Enable or disable the debug trace channel
    pub fn debug(mut self, enable: bool) -> Self {
        self.debug = Some(enable);
        self
    }

    /// Set the plugin namespace prefix
    pub fn plugin_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.plugin_prefix = Some(prefix.into());
        self
    }

    /// Set the TTL for synthesized plugin policies
    pub fn plugin_ttl(mut self, ttl: Duration) -> Self {
        self.plugin_ttl = Some(ttl);
        self
    }

    /// Set the entry cap for synthesized plugin policies
    pub fn plugin_max_entries(mut self, max: usize) -> Self {
        self.plugin_max_entries = Some(max);
        self
    }

    /// Replace the locator field list
    pub fn locator_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locator_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Set the orphan threshold for pending lookups
    pub fn pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = Some(ttl);
        self
    }

    /// Set the pending table capacity
    pub fn max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            max_size_bytes: self.max_size_bytes.unwrap_or(defaults.max_size_bytes),
            max_entries: self.max_entries.unwrap_or(defaults.max_entries),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            store_timeout: self.store_timeout.unwrap_or(defaults.store_timeout),
            max_result_bytes: self.max_result_bytes.unwrap_or(defaults.max_result_bytes),
            skip_error_results: self
                .skip_error_results
                .unwrap_or(defaults.skip_error_results),
            debug: self.debug.unwrap_or(defaults.debug),
            plugin_prefix: self.plugin_prefix.unwrap_or(defaults.plugin_prefix),
            plugin_ttl: self.plugin_ttl.unwrap_or(defaults.plugin_ttl),
            plugin_max_entries: self
                .plugin_max_entries
                .unwrap_or(defaults.plugin_max_entries),
            locator_fields: self.locator_fields.unwrap_or(defaults.locator_fields),
            pending_ttl: self.pending_ttl.unwrap_or(defaults.pending_ttl),
            max_pending: self.max_pending.unwrap_or(defaults.max_pending),
        }
    }
}

/// Preset configurations for common use cases
impl CacheConfig {
    /// Configuration for a single interactive agent session
    pub fn session() -> Self {
        Self {
            max_size_bytes: 20 * 1024 * 1024, // 20 MB
            max_entries: 2_000,
            pending_ttl: Duration::from_secs(300),
            max_pending: 256,
            ..Default::default()
        }
    }

    /// Configuration for memory-constrained environments
    pub fn small() -> Self {
        Self {
            max_size_bytes: 5 * 1024 * 1024, // 5 MB
            max_entries: 500,
            max_result_bytes: 32_000,
            max_pending: 64,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 10_000);
        assert_eq!(config.plugin_prefix, "mcp__");
        assert_eq!(config.locator_fields[0], "file_path");
        assert!(config.skip_error_results);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut invalid_config = CacheConfig::default();
        invalid_config.max_entries = 0;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = CacheConfig::default();
        invalid_config.ttl_jitter = 1.5;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = CacheConfig::default();
        invalid_config.store_timeout = Duration::ZERO;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = CacheConfig::default();
        invalid_config.locator_fields = vec!["".to_string()];
        assert!(invalid_config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::builder()
            .max_size_bytes(4096)
            .max_entries(10)
            .debug(true)
            .locator_fields(["path"])
            .build();

        assert_eq!(config.max_size_bytes, 4096);
        assert_eq!(config.max_entries, 10);
        assert!(config.debug);
        assert_eq!(config.locator_fields, vec!["path".to_string()]);
        assert_eq!(config.store_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_ttl_with_jitter() {
        let config = CacheConfig {
            ttl_jitter: 0.1,
            ..Default::default()
        };

        let ttl = config.ttl_with_jitter(Duration::from_secs(3600));
        assert!(ttl.as_secs_f64() >= 3600.0 - 360.0);
        assert!(ttl.as_secs_f64() <= 3600.0 + 360.0);

        // Zero means never expires and must stay zero
        assert_eq!(config.ttl_with_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("TOOLCACHE_MAX_BYTES", "2048"),
            ("TOOLCACHE_STORE_TIMEOUT_MS", "50"),
            ("TOOLCACHE_DEBUG", "yes"),
            ("TOOLCACHE_PLUGIN_PREFIX", "ext__"),
        ]
        .into_iter()
        .collect();

        let config = CacheConfig::from_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.max_size_bytes, 2048);
        assert_eq!(config.store_timeout, Duration::from_millis(50));
        assert!(config.debug);
        assert_eq!(config.plugin_prefix, "ext__");
    }

    #[test]
    fn test_from_vars_rejects_garbage() {
        let result = CacheConfig::from_vars(|k| {
            (k == "TOOLCACHE_MAX_ENTRIES").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(CacheError::ConfigError(_))));

        let result = CacheConfig::from_vars(|k| (k == "TOOLCACHE_DEBUG").then(|| "maybe".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_preset_configs() {
        let session = CacheConfig::session();
        assert_eq!(session.max_entries, 2_000);
        assert!(session.validate().is_ok());

        let small = CacheConfig::small();
        assert_eq!(small.max_pending, 64);
        assert!(small.validate().is_ok());
    }
}
