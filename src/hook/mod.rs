//! Hook process integration
//!
//! Hosts that run tool hooks as short-lived processes call [`handle_pre`]
//! and [`handle_post`] once per event. Pending lookups cross the process
//! boundary through a [`PendingSpool`], opened per session with
//! [`PendingSpool::for_session`]. The entries themselves live in one
//! persistent store such as [`FileStore`](crate::cache::FileStore) shared by
//! every session, so a mutation in one session invalidates what the others
//! cached.

pub mod protocol;
pub mod spool;

pub use protocol::{HookInput, HookOutput, HookSpecificOutput, POST_TOOL_USE, PRE_TOOL_USE};
pub use spool::PendingSpool;

use crate::cache::adapter::ToolCacheAdapter;
use tracing::warn;

/// Handle a PreToolUse event
pub async fn handle_pre(
    adapter: &ToolCacheAdapter,
    spool: &PendingSpool,
    event: &HookInput,
) -> HookOutput {
    let id = event.correlation_id();
    let outcome = adapter
        .before_invocation(id, &event.tool_name, &event.tool_input)
        .await;

    if let (true, Some(value)) = (outcome.cached, &outcome.value) {
        return HookOutput::cached(&event.tool_name, value);
    }

    if let Some(id) = id {
        if let Some(lookup) = adapter.take_pending(id).await {
            if let Err(e) = spool.save(id, &lookup).await {
                warn!("Could not spool pending lookup for {}: {}", id, e);
            }
        }
    }

    HookOutput::allow()
}

/// Handle a PostToolUse event
pub async fn handle_post(
    adapter: &ToolCacheAdapter,
    spool: &PendingSpool,
    event: &HookInput,
) -> HookOutput {
    let id = event.correlation_id();

    if let Some(id) = id {
        match spool.take(id).await {
            Ok(Some(lookup)) => adapter.restore_pending(id, lookup).await,
            Ok(None) => {}
            Err(e) => warn!("Could not read pending lookup for {}: {}", id, e),
        }
    }

    adapter
        .after_invocation(id, &event.tool_name, &event.tool_input, event.result())
        .await;

    HookOutput::allow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, FileStore};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// A fresh adapter per call, as each hook runs in its own process
    async fn process(root: &std::path::Path) -> (ToolCacheAdapter, PendingSpool) {
        session_process(root, None).await
    }

    async fn session_process(root: &std::path::Path, session: Option<&str>) -> (ToolCacheAdapter, PendingSpool) {
        let config = CacheConfig::default();
        let store = FileStore::from_config(root, &config).await.unwrap();
        let adapter = ToolCacheAdapter::builder()
            .config(config)
            .store(Arc::new(store))
            .build()
            .unwrap();
        (adapter, PendingSpool::for_session(root, session).await.unwrap())
    }

    fn event(tool: &str, id: &str, input: serde_json::Value, result: Option<serde_json::Value>) -> HookInput {
        HookInput {
            tool_name: tool.to_string(),
            tool_input: input,
            tool_use_id: Some(id.to_string()),
            tool_response: result,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_miss_store_hit_across_processes() {
        let dir = TempDir::new().unwrap();
        let input = json!({"file_path": "/repo/a.rs"});

        let (adapter, spool) = process(dir.path()).await;
        let out = handle_pre(&adapter, &spool, &event("Read", "t1", input.clone(), None)).await;
        assert_eq!(out, HookOutput::allow());

        let (adapter, spool) = process(dir.path()).await;
        handle_post(&adapter, &spool, &event("Read", "t1", input.clone(), Some(json!("fn a() {}")))).await;

        let (adapter, spool) = process(dir.path()).await;
        let out = handle_pre(&adapter, &spool, &event("Read", "t2", input.clone(), None)).await;
        assert!(out.system_message.unwrap().ends_with("fn a() {}"));

        // Write to the same file, then the read misses again
        let (adapter, spool) = process(dir.path()).await;
        handle_pre(&adapter, &spool, &event("Write", "t3", input.clone(), None)).await;
        handle_post(&adapter, &spool, &event("Write", "t3", input.clone(), Some(json!("ok")))).await;

        let (adapter, spool) = process(dir.path()).await;
        let out = handle_pre(&adapter, &spool, &event("Read", "t4", input, None)).await;
        assert_eq!(out, HookOutput::allow());
    }

    #[tokio::test]
    async fn test_sessions_share_results_but_not_pending_lookups() {
        let dir = TempDir::new().unwrap();
        let input = json!({"file_path": "/repo/b.rs"});

        // Both sessions miss with the same tool_use_id
        let (adapter, spool_a) = session_process(dir.path(), Some("a")).await;
        handle_pre(&adapter, &spool_a, &event("Read", "toolu_1", input.clone(), None)).await;
        let (adapter, spool_b) = session_process(dir.path(), Some("b")).await;
        handle_pre(&adapter, &spool_b, &event("Glob", "toolu_1", json!({"pattern": "*.rs"}), None)).await;

        // Session a's post finds its own lookup and stores the read
        let (adapter, spool_a) = session_process(dir.path(), Some("a")).await;
        handle_post(&adapter, &spool_a, &event("Read", "toolu_1", input.clone(), Some(json!("fn b() {}")))).await;
        assert!(spool_b.take("toolu_1").await.unwrap().is_some());

        // Session b is served a's result
        let (adapter, spool_b) = session_process(dir.path(), Some("b")).await;
        let out = handle_pre(&adapter, &spool_b, &event("Read", "toolu_2", input.clone(), None)).await;
        assert!(out.system_message.unwrap().ends_with("fn b() {}"));

        // A write in b invalidates it for a as well
        let (adapter, spool_b) = session_process(dir.path(), Some("b")).await;
        handle_post(&adapter, &spool_b, &event("Edit", "toolu_3", input.clone(), Some(json!("ok")))).await;
        let (adapter, spool_a) = session_process(dir.path(), Some("a")).await;
        let out = handle_pre(&adapter, &spool_a, &event("Read", "toolu_4", input, None)).await;
        assert_eq!(out, HookOutput::allow());
    }
}
