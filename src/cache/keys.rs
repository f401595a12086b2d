//! Deterministic cache key derivation
//!
//! A key is `"{operation}:{digest}"` where the digest is the 64-bit FNV-1a hash
//! of the input's canonical JSON form (object fields sorted by name, at every
//! depth). Collisions can only cause a spurious hit within one operation, so a
//! fast non-cryptographic hash is enough here.

use crate::cache::policy::CachePolicy;
use crate::cache::types::CacheKey;
use crate::error::{CacheError, Result};
use serde_json::{Map, Value};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Fixed-width (16 hex digit) digest of a string
pub fn digest(text: &str) -> String {
    format!("{:016x}", fnv1a_64(text.as_bytes()))
}

/// Derive the cache key for `operation` invoked with `input` under `policy`.
///
/// Fails only when the policy's custom key function rejects the input.
pub fn derive_key(operation: &str, input: &Value, policy: &CachePolicy) -> Result<CacheKey> {
    if let Some(custom) = &policy.custom_key {
        let suffix = custom(input).map_err(|reason| CacheError::KeyDerivation {
            operation: operation.to_string(),
            reason,
        })?;
        return Ok(format!("{}:{}", operation, suffix));
    }

    let relevant = select_fields(input, policy);
    Ok(format!("{}:{}", operation, digest(&canonical_json(&relevant)?)))
}

/// Copy of `input` restricted to the fields that participate in the key.
///
/// `null` input is treated as an empty object. Non-object inputs are used as-is.
pub fn select_fields(input: &Value, policy: &CachePolicy) -> Value {
    match input {
        Value::Null => Value::Object(Map::new()),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(name, _)| {
                    policy
                        .key_fields
                        .as_ref()
                        .map_or(true, |allowed| allowed.contains(name.as_str()))
                })
                .filter(|(name, _)| !policy.excluded_fields.contains(name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Serialize a value with object fields in lexicographic order at every depth
pub fn canonical_json(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(&sorted(value))?)
}

/// Rebuild `value` with object fields inserted in name order, so the output
/// is sorted even when `serde_json` is built with `preserve_order`
fn sorted(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                fields
                    .into_iter()
                    .map(|(name, field)| (name.clone(), sorted(field)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

/// Shorten a key for log lines without splitting a character
pub fn truncate_key(key: &str, max_chars: usize) -> &str {
    match key.char_indices().nth(max_chars) {
        Some((idx, _)) => &key[..idx],
        None => key,
    }
}
