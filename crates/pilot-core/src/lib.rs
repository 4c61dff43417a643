mod config;

pub use config::{AgentConfig, LlmConfig, LoopConfig, VerifyConfig};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

/// Directory for pilot runtime state (settings, session db, logs) inside a
/// workspace.
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".pilot")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parse a stored role string. Unknown roles collapse to `User` so a
    /// transcript written by a newer version still loads.
    pub fn parse(s: &str) -> Role {
        match s {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

/// One transcript entry, both in the per-turn history and in the persisted
/// session store.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Type-safe tool name enum covering the fixed tool set exposed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    ListFiles,
    ReadFile,
    WriteFile,
    PatchFile,
    SearchText,
    RunShell,
}

impl ToolName {
    pub const ALL: &'static [ToolName] = &[
        ToolName::ListFiles,
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::PatchFile,
        ToolName::SearchText,
        ToolName::RunShell,
    ];

    #[must_use]
    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "list_files" => Self::ListFiles,
            "read_file" => Self::ReadFile,
            "write_file" => Self::WriteFile,
            "patch_file" => Self::PatchFile,
            "search_text" => Self::SearchText,
            "run_shell" => Self::RunShell,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListFiles => "list_files",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::PatchFile => "patch_file",
            Self::SearchText => "search_text",
            Self::RunShell => "run_shell",
        }
    }

    /// Tools whose success means workspace content changed and verification
    /// must run.
    pub fn is_edit(&self) -> bool {
        matches!(self, Self::WriteFile | Self::PatchFile)
    }

    /// Argument names the model must supply before dispatch.
    pub fn required_args(&self) -> &'static [&'static str] {
        match self {
            Self::ListFiles => &[],
            Self::ReadFile => &["path"],
            Self::WriteFile => &["path", "content"],
            Self::PatchFile => &["path", "find", "replace"],
            Self::SearchText => &["pattern"],
            Self::RunShell => &["command"],
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::ListFiles => "List files under a path relative to workspace.",
            Self::ReadFile => "Read a text file by line range.",
            Self::WriteFile => "Write full file content to path relative to workspace.",
            Self::PatchFile => "Patch a file by exact text replacement.",
            Self::SearchText => "Search text with ripgrep under a path.",
            Self::RunShell => "Run a shell command in workspace with policy checks.",
        }
    }

    /// JSON schema for this tool's arguments, as shown to the model.
    pub fn input_schema(&self) -> Value {
        match self {
            Self::ListFiles => json!({
                "type": "object",
                "properties": {"path": {"type": "string", "default": "."}},
                "additionalProperties": false,
            }),
            Self::ReadFile => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start": {"type": "integer", "default": 1},
                    "end": {"type": "integer", "default": 200},
                },
                "required": ["path"],
                "additionalProperties": false,
            }),
            Self::WriteFile => json!({
                "type": "object",
                "properties": {"path": {"type": "string"}, "content": {"type": "string"}},
                "required": ["path", "content"],
                "additionalProperties": false,
            }),
            Self::PatchFile => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "find": {"type": "string"},
                    "replace": {"type": "string"},
                    "expected_replacements": {"type": "integer"},
                },
                "required": ["path", "find", "replace"],
                "additionalProperties": false,
            }),
            Self::SearchText => json!({
                "type": "object",
                "properties": {"pattern": {"type": "string"}, "path": {"type": "string", "default": "."}},
                "required": ["pattern"],
                "additionalProperties": false,
            }),
            Self::RunShell => json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"],
                "additionalProperties": false,
            }),
        }
    }
}

/// Serialized tool registry appended to the system prompt. This is the sole
/// contract the model relies on for valid action shapes.
pub fn registry_json() -> Value {
    Value::Array(
        ToolName::ALL
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.as_str(),
                    "description": tool.description(),
                    "input_schema": tool.input_schema(),
                })
            })
            .collect(),
    )
}

/// One validated decision from the model: a final message or a single tool
/// invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Message {
        content: String,
    },
    Tool {
        name: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
}

/// Outcome of one tool invocation. Created once per dispatch and never
/// mutated; history folding works on clipped copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(tool: &str, result: Value) -> Self {
        Self {
            ok: true,
            tool: tool.to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(tool: &str, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            tool: tool.to_string(),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Per-turn step allowance split into an execution phase and a reserved
/// verification/finalization phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBudget {
    pub total: u32,
    pub reserved: u32,
    pub execution_limit: u32,
}

impl StepBudget {
    /// `reserved = min(fixed_reserve, max(total - 1, 0))` and
    /// `execution_limit = max(1, total - reserved)`, so even a tiny budget
    /// leaves one execution step and a large one always keeps the reserve.
    pub fn new(total_steps: u32, fixed_reserve: u32) -> Self {
        let total = total_steps.max(1);
        let reserved = fixed_reserve.min(total.saturating_sub(1));
        Self {
            total,
            reserved,
            execution_limit: (total - reserved).max(1),
        }
    }
}

/// Clip a string for transport into history, marking the cut.
pub fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...(truncated)")
}

/// Compact single-line JSON, the only serialization the model ever sees.
pub fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}
