//! Wire types for PreToolUse / PostToolUse hook processes

use crate::cache::types::CacheValue;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PRE_TOOL_USE: &str = "PreToolUse";
pub const POST_TOOL_USE: &str = "PostToolUse";

/// Event delivered on stdin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub hook_event_name: Option<String>,

    #[serde(default)]
    pub tool_name: String,

    #[serde(default)]
    pub tool_input: Value,

    /// Pairs the pre and post events of one tool call
    #[serde(default)]
    pub tool_use_id: Option<String>,

    /// Present on PostToolUse only
    #[serde(default, alias = "tool_result")]
    pub tool_response: Option<Value>,
}

impl HookInput {
    /// Parse a hook event; empty input is a protocol error
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(CacheError::ProtocolError("empty hook input".to_string()));
        }
        let input: Self = serde_json::from_str(text)?;
        if input.tool_name.is_empty() {
            return Err(CacheError::ProtocolError("missing tool_name".to_string()));
        }
        Ok(input)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.tool_use_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Tool result, `null` when absent
    pub fn result(&self) -> &Value {
        self.tool_response.as_ref().unwrap_or(&Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSpecificOutput {
    pub hook_event_name: String,
    pub permission_decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_decision_reason: Option<String>,
}

/// Response written to stdout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<HookSpecificOutput>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
}

impl HookOutput {
    /// Let the tool run; serializes as `{}`
    pub fn allow() -> Self {
        Self::default()
    }

    /// Skip the tool and hand the cached result back to the model
    pub fn cached(tool_name: &str, value: &CacheValue) -> Self {
        let body = match value {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        };

        Self {
            hook_specific_output: Some(HookSpecificOutput {
                hook_event_name: PRE_TOOL_USE.to_string(),
                permission_decision: "deny".to_string(),
                permission_decision_reason: Some(format!("Cached result for {} is still valid", tool_name)),
            }),
            system_message: Some(format!(
                "[CACHE HIT for {}] Returning cached result (tool execution skipped):\n\n{}",
                tool_name, body
            )),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
