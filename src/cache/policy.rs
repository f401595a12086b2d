//! Per-operation cache policies
//!
//! Each operation resolves to at most one [`CachePolicy`]. The registry is
//! built from a plain default table merged with caller overrides, so tests can
//! hand in a fully isolated table.
//!
//! | Operation        | Cacheable          | TTL    | Invalidated by                  |
//! |------------------|--------------------|--------|---------------------------------|
//! | Read             | yes                | 5 min  | Write, Edit, MultiEdit, NotebookEdit (narrow) |
//! | Glob, Grep       | yes                | 30 min | Write, Edit, MultiEdit, NotebookEdit (broad)  |
//! | WebFetch         | yes                | 15 min | -                               |
//! | WebSearch        | yes                | 5 min  | -                               |
//! | Bash             | read-only commands | 5 min  | -                               |
//! | text_editor      | `view` only        | 5 min  | -                               |
//! | Write, Edit, ... | never              | -      | -                               |
//! | `mcp__*`         | yes (synthesized)  | 60 s   | -                               |

use crate::cache::config::CacheConfig;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Input fields that never affect a tool's result
pub const TRANSIENT_FIELDS: &[&str] = &["description", "run_in_background", "dangerouslyDisableSandbox"];

/// Fallback TTL for policies created from an override alone
const BASE_TTL: Duration = Duration::from_secs(300);

/// Fallback entry cap for policies created from an override alone
const BASE_MAX_ENTRIES: usize = 1_000;

/// Shell commands whose output depends only on observable state
const READ_ONLY_COMMANDS: &[&str] = &[
    "git status", "git log", "git diff", "git branch", "git remote",
    "git show", "git rev-parse", "git describe", "git tag",
    "ls", "pwd", "whoami", "hostname", "uname",
    "which", "type", "file", "stat", "wc",
    "node --version", "npm --version", "python --version", "python3 --version",
    "npm list", "npm ls", "npm view", "npx --version",
    "gh pr view", "gh pr list", "gh issue view", "gh issue list",
    "gh api", "gh repo view",
    "date", "cal", "env", "printenv",
    "jq", "yq",
];

/// Shell commands with side effects; checked before the read-only list
const MUTATING_COMMANDS: &[&str] = &[
    "git add", "git commit", "git push", "git pull", "git fetch",
    "git merge", "git rebase", "git reset", "git checkout", "git switch",
    "git stash", "git cherry-pick", "git revert", "git clean",
    "rm", "mv", "cp", "mkdir", "rmdir", "touch", "chmod", "chown",
    "npm install", "npm ci", "npm run", "npm exec", "npm publish",
    "npx", "yarn", "pnpm",
    "pip install", "pip uninstall",
    "docker", "kubectl", "terraform",
    "curl -x post", "curl -x put", "curl -x delete", "curl -x patch",
    "gh pr create", "gh pr merge", "gh pr close", "gh issue create",
    "kill", "pkill",
];

/// Whether results for an operation may be cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// Never cache
    Never,
    /// Same input yields the same result until a mutation says otherwise
    Idempotent,
}

/// Per-invocation admission rule on top of the strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheCondition {
    /// Only cache when `field` holds a known read-only shell command
    ReadOnlyShellCommand { field: String },

    /// Only cache when `field` equals `value`
    FieldEquals { field: String, value: Value },
}

impl CacheCondition {
    /// Check whether an invocation with `input` may be cached
    pub fn accepts(&self, input: &Value) -> bool {
        match self {
            CacheCondition::ReadOnlyShellCommand { field } => input
                .get(field)
                .and_then(Value::as_str)
                .map_or(false, is_read_only_command),
            CacheCondition::FieldEquals { field, value } => input.get(field) == Some(value),
        }
    }
}

/// Sequencing, redirection and substitution can hide a side effect anywhere
const SHELL_SIDE_CHANNELS: &[&str] = &[";", "&&", "||", ">", "`", "$(", "\n"];

/// Classify a shell command line as safe to cache.
///
/// Mutating prefixes win over read-only ones; a pipeline is judged by its
/// first stage; anything unknown is not cached.
pub fn is_read_only_command(command: &str) -> bool {
    let cmd = command.trim().to_lowercase();
    if cmd.is_empty() || SHELL_SIDE_CHANNELS.iter().any(|s| cmd.contains(s)) {
        return false;
    }

    if MUTATING_COMMANDS.iter().any(|p| starts_with_word(&cmd, p)) {
        return false;
    }

    if READ_ONLY_COMMANDS.iter().any(|p| starts_with_word(&cmd, p)) {
        return true;
    }

    match cmd.split_once('|') {
        Some((first, _)) if !first.trim().is_empty() => is_read_only_command(first),
        _ => false,
    }
}

fn starts_with_word(cmd: &str, prefix: &str) -> bool {
    cmd.strip_prefix(prefix)
        .map_or(false, |rest| rest.is_empty() || rest.starts_with(|c: char| c.is_whitespace() || c == '|'))
}

/// Caller-supplied key function; `Err` makes the call uncacheable
pub type CustomKeyFn = Arc<dyn Fn(&Value) -> std::result::Result<String, String> + Send + Sync>;

/// Caching rules for a single operation
#[derive(Clone)]
pub struct CachePolicy {
    /// Whether results are cached at all
    pub strategy: CacheStrategy,

    /// Lifetime of stored results; zero never expires
    pub ttl: Duration,

    /// Cap on stored results for this operation
    pub max_entries: usize,

    /// Input fields removed before hashing
    pub excluded_fields: BTreeSet<String>,

    /// When set, only these input fields participate in the key
    pub key_fields: Option<BTreeSet<String>>,

    /// Input field that scopes a result to one resource
    pub locator_field: Option<String>,

    /// Extra admission rule evaluated per invocation
    pub condition: Option<CacheCondition>,

    /// Replaces the hashed digest in the key
    pub custom_key: Option<CustomKeyFn>,
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("strategy", &self.strategy)
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .field("excluded_fields", &self.excluded_fields)
            .field("key_fields", &self.key_fields)
            .field("locator_field", &self.locator_field)
            .field("condition", &self.condition)
            .field("custom_key", &self.custom_key.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl CachePolicy {
    /// A policy that never caches
    pub fn never() -> Self {
        Self {
            strategy: CacheStrategy::Never,
            ttl: BASE_TTL,
            max_entries: BASE_MAX_ENTRIES,
            excluded_fields: BTreeSet::new(),
            key_fields: None,
            locator_field: None,
            condition: None,
            custom_key: None,
        }
    }

    /// A caching policy with the given TTL and no key adjustments
    pub fn idempotent(ttl: Duration) -> Self {
        Self {
            strategy: CacheStrategy::Idempotent,
            ttl,
            ..Self::never()
        }
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Add fields to the exclusion set
    pub fn with_excluded_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn with_key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_locator(mut self, field: impl Into<String>) -> Self {
        self.locator_field = Some(field.into());
        self
    }

    pub fn with_condition(mut self, condition: CacheCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_custom_key(mut self, key_fn: CustomKeyFn) -> Self {
        self.custom_key = Some(key_fn);
        self
    }

    /// Whether the strategy caches at all
    pub fn is_cacheable(&self) -> bool {
        self.strategy == CacheStrategy::Idempotent
    }

    /// Value of the locator field in `input`, when present and non-empty
    pub fn locator_of<'a>(&self, input: &'a Value) -> Option<&'a str> {
        let field = self.locator_field.as_deref()?;
        input.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Whether this particular invocation may be served from or stored in cache
    pub fn admits(&self, input: &Value) -> bool {
        self.is_cacheable() && self.condition.as_ref().map_or(true, |c| c.accepts(input))
    }

    /// Validate the policy for `operation`
    pub fn validate(&self, operation: &str) -> Result<()> {
        let invalid = |reason: &str| CacheError::InvalidPolicy {
            operation: operation.to_string(),
            reason: reason.to_string(),
        };

        if self.is_cacheable() && self.max_entries == 0 {
            return Err(invalid("max_entries must be greater than 0 for a cached operation"));
        }

        if self.excluded_fields.iter().any(|f| f.is_empty()) {
            return Err(invalid("excluded_fields must not contain empty names"));
        }

        if let Some(fields) = &self.key_fields {
            if fields.is_empty() {
                return Err(invalid("key_fields, when set, must name at least one field"));
            }
            if fields.iter().any(|f| f.is_empty()) {
                return Err(invalid("key_fields must not contain empty names"));
            }
        }

        if matches!(&self.locator_field, Some(f) if f.is_empty()) {
            return Err(invalid("locator_field must not be empty"));
        }

        Ok(())
    }
}

/// Field-by-field override merged onto a default policy.
///
/// Numeric fields are signed so that nonsense values are caught by validation
/// instead of being silently clamped by deserialization.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
    pub strategy: Option<CacheStrategy>,
    pub ttl_secs: Option<i64>,
    pub max_entries: Option<i64>,
    pub excluded_fields: Option<BTreeSet<String>>,
    pub key_fields: Option<BTreeSet<String>>,
    pub locator_field: Option<String>,
    pub condition: Option<CacheCondition>,
    #[serde(skip)]
    pub custom_key: Option<CustomKeyFn>,
}

impl fmt::Debug for PolicyOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyOverride")
            .field("strategy", &self.strategy)
            .field("ttl_secs", &self.ttl_secs)
            .field("max_entries", &self.max_entries)
            .field("excluded_fields", &self.excluded_fields)
            .field("key_fields", &self.key_fields)
            .field("locator_field", &self.locator_field)
            .field("condition", &self.condition)
            .field("custom_key", &self.custom_key.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl PolicyOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn ttl_secs(mut self, secs: i64) -> Self {
        self.ttl_secs = Some(secs);
        self
    }

    pub fn max_entries(mut self, max: i64) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn excluded_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn locator_field(mut self, field: impl Into<String>) -> Self {
        self.locator_field = Some(field.into());
        self
    }

    pub fn condition(mut self, condition: CacheCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn custom_key(mut self, key_fn: CustomKeyFn) -> Self {
        self.custom_key = Some(key_fn);
        self
    }

    /// Merge this override onto `base`, rejecting invalid values
    pub fn apply(&self, operation: &str, base: CachePolicy) -> Result<CachePolicy> {
        let invalid = |reason: String| CacheError::InvalidPolicy {
            operation: operation.to_string(),
            reason,
        };

        let mut policy = base;

        if let Some(strategy) = self.strategy {
            policy.strategy = strategy;
        }
        if let Some(secs) = self.ttl_secs {
            if secs < 0 {
                return Err(invalid(format!("ttl must not be negative, got {}s", secs)));
            }
            policy.ttl = Duration::from_secs(secs as u64);
        }
        if let Some(max) = self.max_entries {
            if max <= 0 {
                return Err(invalid(format!("max_entries must be positive, got {}", max)));
            }
            policy.max_entries = max as usize;
        }
        if let Some(fields) = &self.excluded_fields {
            policy.excluded_fields = fields.clone();
        }
        if let Some(fields) = &self.key_fields {
            policy.key_fields = Some(fields.clone());
        }
        if let Some(field) = &self.locator_field {
            policy.locator_field = Some(field.clone());
        }
        if let Some(condition) = &self.condition {
            policy.condition = Some(condition.clone());
        }
        if let Some(key_fn) = &self.custom_key {
            policy.custom_key = Some(key_fn.clone());
        }

        policy.validate(operation)?;
        Ok(policy)
    }
}

/// Resolves operation names to policies
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<CachePolicy>>,
    plugin_prefix: String,
    plugin_policy: Arc<CachePolicy>,
}

impl PolicyRegistry {
    /// Registry over the built-in table with `overrides` merged on top
    pub fn new(config: &CacheConfig, overrides: HashMap<String, PolicyOverride>) -> Result<Self> {
        Self::from_table(Self::default_table(), overrides, config)
    }

    /// Registry over an arbitrary table with `overrides` merged on top
    pub fn from_table(
        table: HashMap<String, CachePolicy>,
        overrides: HashMap<String, PolicyOverride>,
        config: &CacheConfig,
    ) -> Result<Self> {
        let plugin_policy = Self::plugin_policy(config);
        plugin_policy.validate(&config.plugin_prefix)?;

        let mut merged = table;
        for (operation, policy_override) in overrides {
            let base = match merged.remove(&operation) {
                Some(existing) => existing,
                None if operation.starts_with(&config.plugin_prefix) => plugin_policy.clone(),
                None => CachePolicy::never(),
            };
            let policy = policy_override.apply(&operation, base)?;
            merged.insert(operation, policy);
        }

        let mut policies = HashMap::with_capacity(merged.len());
        for (operation, policy) in merged {
            policy.validate(&operation)?;
            policies.insert(operation, Arc::new(policy));
        }

        Ok(Self {
            policies,
            plugin_prefix: config.plugin_prefix.clone(),
            plugin_policy: Arc::new(plugin_policy),
        })
    }

    /// Resolve the policy for an operation; `None` means do not cache
    pub fn resolve(&self, operation: &str) -> Option<Arc<CachePolicy>> {
        if let Some(policy) = self.policies.get(operation) {
            return Some(policy.clone());
        }
        if operation.starts_with(&self.plugin_prefix) && operation.len() > self.plugin_prefix.len() {
            return Some(self.plugin_policy.clone());
        }
        None
    }

    /// Explicitly configured operations and their policies
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<CachePolicy>)> {
        self.policies.iter().map(|(op, policy)| (op.as_str(), policy))
    }

    /// Conservative policy for plugin tools without an explicit entry
    pub fn plugin_policy(config: &CacheConfig) -> CachePolicy {
        CachePolicy::idempotent(config.plugin_ttl)
            .with_max_entries(config.plugin_max_entries)
            .with_excluded_fields(TRANSIENT_FIELDS.iter().copied())
    }

    /// Built-in policy table
    pub fn default_table() -> HashMap<String, CachePolicy> {
        let cached = |ttl_secs: u64| {
            CachePolicy::idempotent(Duration::from_secs(ttl_secs))
                .with_excluded_fields(TRANSIENT_FIELDS.iter().copied())
        };
        let shell = || CacheCondition::ReadOnlyShellCommand {
            field: "command".to_string(),
        };

        let mut table = HashMap::new();

        // Host tools
        table.insert(
            "Read".to_string(),
            cached(300)
                .with_key_fields(["file_path", "offset", "limit", "pages"])
                .with_locator("file_path"),
        );
        table.insert("Glob".to_string(), cached(1800).with_key_fields(["pattern", "path"]));
        table.insert(
            "Grep".to_string(),
            cached(1800).with_key_fields([
                "pattern", "path", "type", "glob", "output_mode",
                "-A", "-B", "-C", "-i", "-n", "multiline",
                "head_limit", "offset",
            ]),
        );
        table.insert("WebFetch".to_string(), cached(900).with_key_fields(["url", "prompt"]));
        table.insert(
            "WebSearch".to_string(),
            cached(300).with_key_fields(["query", "allowed_domains", "blocked_domains"]),
        );
        table.insert(
            "Bash".to_string(),
            cached(300).with_key_fields(["command"]).with_condition(shell()),
        );

        // API tools
        table.insert(
            "web_search".to_string(),
            cached(300).with_key_fields(["query", "allowed_domains", "blocked_domains"]),
        );
        table.insert("web_fetch".to_string(), cached(900).with_key_fields(["url"]));
        table.insert(
            "bash".to_string(),
            cached(300).with_key_fields(["command"]).with_condition(shell()),
        );
        table.insert(
            "text_editor".to_string(),
            cached(300)
                .with_key_fields(["command", "path"])
                .with_condition(CacheCondition::FieldEquals {
                    field: "command".to_string(),
                    value: Value::String("view".to_string()),
                }),
        );

        for operation in [
            "Write", "Edit", "MultiEdit", "NotebookEdit", "Task", "TodoWrite",
            "AskUserQuestion", "code_execution", "memory", "computer_use",
        ] {
            table.insert(operation.to_string(), CachePolicy::never());
        }

        table
    }
}
