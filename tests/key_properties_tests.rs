//! Properties of cache key derivation over many inputs

use ouroboros_toolcache::cache::{derive_key, CacheConfig, PolicyRegistry};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};

fn registry() -> PolicyRegistry {
    PolicyRegistry::new(&CacheConfig::default(), HashMap::new()).unwrap()
}

#[test]
fn test_keys_are_deterministic() {
    let registry = registry();
    let policy = registry.resolve("Grep").unwrap();

    let input = json!({
        "pattern": "fn\\s+main",
        "path": "/repo",
        "glob": "*.rs",
        "-n": true,
        "head_limit": 20,
        "nested": {"b": [1, 2, {"y": null, "x": "x"}], "a": 1.5}
    });

    let first = derive_key("Grep", &input, &policy).unwrap();
    for _ in 0..100 {
        assert_eq!(derive_key("Grep", &input, &policy).unwrap(), first);
    }
}

#[test]
fn test_insertion_order_never_changes_the_key() {
    let registry = registry();
    // Plugin tools hash every input field
    let policy = registry.resolve("mcp__index__query").unwrap();

    let fields: Vec<(String, Value)> = (0..12)
        .map(|i| (format!("field_{}", i), json!(i * 7)))
        .collect();

    let forward: Map<String, Value> = fields.iter().cloned().collect();
    let reverse: Map<String, Value> = fields.iter().rev().cloned().collect();

    assert_eq!(
        derive_key("mcp__index__query", &Value::Object(forward), &policy).unwrap(),
        derive_key("mcp__index__query", &Value::Object(reverse), &policy).unwrap()
    );
}

#[test]
fn test_no_collisions_across_distinct_inputs() {
    let registry = registry();
    let read = registry.resolve("Read").unwrap();
    let grep = registry.resolve("Grep").unwrap();

    let mut seen = HashSet::new();

    for i in 0..5_000 {
        let key = derive_key("Read", &json!({"file_path": format!("/src/module_{}.rs", i)}), &read).unwrap();
        assert!(seen.insert(key), "collision on Read input {}", i);
    }

    for i in 0..5_000 {
        let input = json!({"pattern": format!("needle{}", i % 100), "head_limit": i / 100});
        let key = derive_key("Grep", &input, &grep).unwrap();
        assert!(seen.insert(key), "collision on Grep input {}", i);
    }

    assert_eq!(seen.len(), 10_000);
}

#[test]
fn test_values_that_differ_only_in_type_get_distinct_keys() {
    let registry = registry();
    let policy = registry.resolve("Glob").unwrap();

    let variants = [
        json!({"pattern": "1"}),
        json!({"pattern": 1}),
        json!({"pattern": [1]}),
        json!({"pattern": null}),
        json!({"pattern": true}),
        json!({"pattern": "true"}),
    ];

    let keys: HashSet<String> = variants
        .iter()
        .map(|v| derive_key("Glob", v, &policy).unwrap())
        .collect();
    assert_eq!(keys.len(), variants.len());
}

#[test]
fn test_fields_outside_the_allow_list_do_not_split_keys() {
    let registry = registry();
    let grep = registry.resolve("Grep").unwrap();

    let base = json!({"pattern": "TODO", "path": "/repo", "-n": true});
    let noisy = json!({"pattern": "TODO", "path": "/repo", "-n": true, "request_id": 42});
    let different = json!({"pattern": "TODO", "path": "/repo", "-n": false});

    assert_eq!(derive_key("Grep", &base, &grep).unwrap(), derive_key("Grep", &noisy, &grep).unwrap());
    assert_ne!(derive_key("Grep", &base, &grep).unwrap(), derive_key("Grep", &different, &grep).unwrap());
}
