//! Fuzzy-by-design predicates and extractors kept out of the loop's control
//! flow so phrase lists and patterns can be tuned independently.

use pilot_core::ToolName;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

const PROGRESS_MARKERS: &[&str] = &[
    "i will now",
    "i'll now",
    "i will",
    "i have the full",
    "i have gathered",
    "i have located",
    "i can now",
    "i will proceed",
    "proceed with",
];

const COMPLETION_MARKERS: &[&str] = &[
    "done",
    "completed",
    "updated",
    "changed",
    "verification",
    "compiled",
    "summary",
];

/// True when a candidate final message narrates intent without reporting any
/// completed work. Such messages must not terminate the turn.
pub fn is_progress_only_message(content: &str) -> bool {
    let lower = content.trim().to_lowercase();
    PROGRESS_MARKERS.iter().any(|m| lower.contains(m))
        && !COMPLETION_MARKERS.iter().any(|m| lower.contains(m))
}

fn file_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"([A-Za-z0-9_\-./]+\.(?:py|rs|toml|md|txt|json|yaml|yml|js|ts|go|java|c|h|cpp|sh))\b",
        )
        .expect("valid path regex")
    })
}

fn backtick_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([^`]+)`").expect("valid backtick regex"))
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]{2,})\b").expect("valid ident regex"))
}

pub fn extract_first_file_path(text: &str) -> Option<String> {
    file_path_regex()
        .captures(text)
        .map(|c| c[1].to_string())
}

pub fn derive_pattern_from_request(text: &str) -> Option<String> {
    for capture in backtick_regex().captures_iter(text) {
        let cleaned = capture[1].trim();
        if !cleaned.is_empty() {
            return Some(cleaned.to_string());
        }
    }
    identifier_regex()
        .captures(text)
        .map(|c| c[1].to_string())
}

/// Best-effort repair of missing-but-guessable required arguments from the
/// original user instruction. Advisory only; dispatch still validates.
pub fn repair_tool_args(
    tool: ToolName,
    args: &Map<String, Value>,
    user_input: &str,
) -> Map<String, Value> {
    let mut repaired = args.clone();
    if tool.required_args().contains(&"path") && !repaired.contains_key("path") {
        if let Some(guessed) = extract_first_file_path(user_input) {
            repaired.insert("path".to_string(), Value::String(guessed));
        }
    }
    if tool == ToolName::SearchText && !repaired.contains_key("pattern") {
        if let Some(guessed) = derive_pattern_from_request(user_input) {
            repaired.insert("pattern".to_string(), Value::String(guessed));
        }
    }
    repaired
}
