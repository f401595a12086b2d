//! Error types for tool cache operations
//!
//! This module defines the error type shared by the stores, the policy
//! registry and the adapter. Lifecycle callbacks never surface these to the
//! host; administrative calls and constructors do.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Configuration error - rejected at construction time
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A policy override failed validation
    #[error("Invalid policy for '{operation}': {reason}")]
    InvalidPolicy { operation: String, reason: String },

    /// Key derivation failed (custom key function rejected the input)
    #[error("Key derivation failed for '{operation}': {reason}")]
    KeyDerivation { operation: String, reason: String },

    /// Backing store error
    #[error("Store error: {0}")]
    StoreError(String),

    /// Store operation exceeded its time budget
    #[error("Store operation timed out after {timeout_ms}ms: {context}")]
    TimeoutError { timeout_ms: u64, context: String },

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Hook wire protocol error
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}
