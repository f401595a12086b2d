//! Invalidation of cached results after mutating operations
//!
//! A mutating operation names the operations whose results it may have made
//! stale. When the mutation's input carries a resource locator (a file path,
//! say), only the entries each affected operation read from that locator are
//! deleted, whatever other input they were called with (narrow). Otherwise
//! the affected operations are cleared entirely (broad).

use crate::cache::{
    config::CacheConfig,
    policy::PolicyRegistry,
    store::{with_timeout, CacheStore},
    types::CacheKey,
};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Mutating operations that write files
const FILE_MUTATIONS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];

/// Operations whose results depend on file contents
const FILE_READERS: &[&str] = &["Read", "Glob", "Grep"];

/// Map from mutating operation to the operations it invalidates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMap {
    rules: HashMap<String, BTreeSet<String>>,
}

impl InvalidationMap {
    /// Built-in map: file mutations invalidate file readers
    pub fn defaults() -> Self {
        let readers: BTreeSet<String> = FILE_READERS.iter().map(|s| s.to_string()).collect();
        Self {
            rules: FILE_MUTATIONS
                .iter()
                .map(|op| (op.to_string(), readers.clone()))
                .collect(),
        }
    }

    /// A map with no rules
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replace the affected set for each overridden operation
    pub fn with_overrides(mut self, overrides: HashMap<String, BTreeSet<String>>) -> Self {
        self.rules.extend(overrides);
        self
    }

    pub fn insert<I, S>(&mut self, operation: impl Into<String>, affected: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .insert(operation.into(), affected.into_iter().map(Into::into).collect());
    }

    /// Operations invalidated by `operation`, if it is a known mutation
    pub fn affected(&self, operation: &str) -> Option<&BTreeSet<String>> {
        self.rules.get(operation)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// How a mutation was scoped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InvalidationScope {
    /// The mutation named a single resource
    Narrow { locator: String },

    /// No locator; affected operations are cleared
    Broad,
}

impl fmt::Display for InvalidationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationScope::Narrow { locator } => write!(f, "narrow ({})", locator),
            InvalidationScope::Broad => write!(f, "broad"),
        }
    }
}

/// A single store action planned for a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationAction {
    /// Delete every entry an affected operation read from the locator
    DeleteLocator { operation: String, locator: String },

    /// Remove every entry of an affected operation
    ClearOperation { operation: String },
}

/// Record of one mutation's invalidation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Mutating operation that triggered the invalidation
    pub trigger: String,

    pub scope: InvalidationScope,

    /// Keys deleted by locator
    pub keys_deleted: Vec<CacheKey>,

    /// Entries removed by operation-wide clears
    pub entries_cleared: usize,

    /// Actions that failed or timed out
    pub failures: usize,

    /// When the invalidation ran
    pub timestamp: DateTime<Utc>,
}

impl InvalidationEvent {
    fn new(trigger: &str, scope: InvalidationScope) -> Self {
        Self {
            trigger: trigger.to_string(),
            scope,
            keys_deleted: Vec::new(),
            entries_cleared: 0,
            failures: 0,
            timestamp: Utc::now(),
        }
    }

    /// Total entries removed
    pub fn removed(&self) -> usize {
        self.keys_deleted.len() + self.entries_cleared
    }
}

/// Applies an [`InvalidationMap`] against a store
#[derive(Debug, Clone)]
pub struct InvalidationEngine {
    map: InvalidationMap,
    locator_fields: Vec<String>,
    action_timeout: Option<Duration>,
}

impl InvalidationEngine {
    pub fn new(map: InvalidationMap, locator_fields: Vec<String>) -> Self {
        Self {
            map,
            locator_fields,
            action_timeout: None,
        }
    }

    /// Engine using the configured locator fields and per-call time budget
    pub fn from_config(map: InvalidationMap, config: &CacheConfig) -> Self {
        Self::new(map, config.locator_fields.clone()).with_action_timeout(config.store_timeout)
    }

    /// Abandon any single store action that takes longer than `timeout`
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = Some(timeout);
        self
    }

    pub fn map(&self) -> &InvalidationMap {
        &self.map
    }

    /// First non-empty string among the locator fields
    pub fn extract_locator(&self, input: &Value) -> Option<String> {
        self.locator_fields.iter().find_map(|field| {
            input
                .get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    }

    /// Work out what a completed `operation` invalidates.
    /// `None` when the operation is not a known mutation.
    pub fn plan(
        &self,
        operation: &str,
        input: &Value,
        registry: &PolicyRegistry,
    ) -> Option<(InvalidationScope, Vec<InvalidationAction>)> {
        let affected = self.map.affected(operation)?;
        let locator = self.extract_locator(input);

        let actions = affected
            .iter()
            .map(|target| match &locator {
                Some(loc) => narrow_action(target, loc, registry),
                None => InvalidationAction::ClearOperation {
                    operation: target.clone(),
                },
            })
            .collect();

        let scope = match locator {
            Some(locator) => InvalidationScope::Narrow { locator },
            None => InvalidationScope::Broad,
        };

        Some((scope, actions))
    }

    /// Invalidate whatever a completed mutation made stale.
    ///
    /// Failing actions are logged and counted; the rest still run.
    pub async fn on_mutating_completion(
        &self,
        operation: &str,
        input: &Value,
        registry: &PolicyRegistry,
        store: &dyn CacheStore,
    ) -> Option<InvalidationEvent> {
        let (scope, actions) = self.plan(operation, input, registry)?;
        let mut event = InvalidationEvent::new(operation, scope);

        for action in actions {
            match &action {
                InvalidationAction::DeleteLocator { operation: target, locator } => {
                    match self
                        .bounded("delete", store.delete_by_locator(target, locator))
                        .await
                    {
                        Ok(keys) => event.keys_deleted.extend(keys),
                        Err(e) => {
                            warn!(
                                "Invalidation of {} for {} after {} failed: {}",
                                target, locator, operation, e
                            );
                            event.failures += 1;
                        }
                    }
                }
                InvalidationAction::ClearOperation { operation: target } => {
                    match self.bounded("clear", store.clear(Some(target))).await {
                        Ok(count) => event.entries_cleared += count,
                        Err(e) => {
                            warn!("Clearing {} after {} failed: {}", target, operation, e);
                            event.failures += 1;
                        }
                    }
                }
            }
        }

        debug!(
            "{} invalidated {} entries ({})",
            operation,
            event.removed(),
            event.scope
        );
        Some(event)
    }

    async fn bounded<T>(&self, context: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match self.action_timeout {
            Some(budget) => with_timeout(budget, context, call).await,
            None => call.await,
        }
    }
}

/// Delete `target`'s entries for `locator`, or clear `target` when it has
/// no locator field
fn narrow_action(target: &str, locator: &str, registry: &PolicyRegistry) -> InvalidationAction {
    let scoped = registry
        .resolve(target)
        .map_or(false, |policy| policy.locator_field.is_some());

    if scoped {
        InvalidationAction::DeleteLocator {
            operation: target.to_string(),
            locator: locator.to_string(),
        }
    } else {
        InvalidationAction::ClearOperation {
            operation: target.to_string(),
        }
    }
}
