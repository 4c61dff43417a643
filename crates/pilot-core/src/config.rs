use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::runtime_dir;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub llm: LlmConfig,
    pub agent_loop: LoopConfig,
    pub verify: VerifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    /// Model used for the advisory verifier call. Empty means "same as model".
    pub verifier_model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-5.1".to_string(),
            verifier_model: String::new(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_seconds: 120,
            max_retries: 2,
            max_tokens: 1000,
        }
    }
}

impl LlmConfig {
    pub fn verifier_model(&self) -> &str {
        if self.verifier_model.is_empty() {
            &self.model
        } else {
            &self.verifier_model
        }
    }
}

/// Loop thresholds. The defaults are behaviorally load-bearing (tests and the
/// abort/continue decisions depend on them) but deliberately tunable here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub max_steps: u32,
    /// Steps held back from execution for verification + final summary.
    pub verification_reserve: u32,
    pub shell_timeout_seconds: u64,
    /// Persisted messages re-seeded into each turn's history.
    pub history_tail: usize,
    /// Clip applied to each re-seeded history message.
    pub history_clip_chars: usize,
    /// Clip applied to tool result payloads folded into history.
    pub tool_result_clip_chars: usize,
    /// Identical (tool, error) failures tolerated before aborting the turn.
    pub repeat_failure_threshold: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            verification_reserve: 4,
            shell_timeout_seconds: 30,
            history_tail: 6,
            history_clip_chars: 1500,
            tool_result_clip_chars: 1800,
            repeat_failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Static validity check run after every successful edit.
    pub compile_command: String,
    /// Behavioral check run after every successful edit.
    pub behavior_command: String,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            compile_command: "python3 -m compileall -q .".to_string(),
            behavior_command: "PYTHONPATH=. python3 -m unittest tests/test_search_text_behavior.py -v"
                .to_string(),
        }
    }
}

impl AgentConfig {
    pub fn settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    /// Load settings merged over defaults, then apply environment overrides.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        let path = Self::settings_path(workspace);
        if path.exists() {
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }
        let mut cfg: Self = serde_json::from_value(merged)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load, writing a default settings file on first run.
    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::settings_path(workspace);
        if !path.exists() {
            Self::default().save(workspace)?;
        }
        Self::load(workspace)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid settings path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("PILOT_MODEL") {
            if !model.trim().is_empty() {
                self.llm.model = model;
            }
        }
        if let Ok(model) = std::env::var("PILOT_VERIFIER_MODEL") {
            if !model.trim().is_empty() {
                self.llm.verifier_model = model;
            }
        }
        if let Ok(endpoint) = std::env::var("PILOT_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.llm.endpoint = endpoint;
            }
        }
        if let Ok(steps) = std::env::var("PILOT_MAX_STEPS") {
            if let Ok(parsed) = steps.trim().parse() {
                self.agent_loop.max_steps = parsed;
            }
        }
        if let Ok(timeout) = std::env::var("PILOT_SHELL_TIMEOUT") {
            if let Ok(parsed) = timeout.trim().parse() {
                self.agent_loop.shell_timeout_seconds = parsed;
            }
        }
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_thresholds() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.agent_loop.max_steps, 25);
        assert_eq!(cfg.agent_loop.verification_reserve, 4);
        assert_eq!(cfg.agent_loop.history_tail, 6);
        assert_eq!(cfg.agent_loop.history_clip_chars, 1500);
        assert_eq!(cfg.agent_loop.tool_result_clip_chars, 1800);
        assert_eq!(cfg.agent_loop.repeat_failure_threshold, 3);
    }

    #[test]
    fn partial_settings_merge_over_defaults() {
        let mut merged = serde_json::to_value(AgentConfig::default()).unwrap();
        let overlay: serde_json::Value =
            serde_json::from_str(r#"{"agent_loop":{"max_steps":7},"llm":{"model":"local"}}"#)
                .unwrap();
        merge_json_value(&mut merged, &overlay);
        let cfg: AgentConfig = serde_json::from_value(merged).unwrap();
        assert_eq!(cfg.agent_loop.max_steps, 7);
        assert_eq!(cfg.llm.model, "local");
        // untouched fields keep defaults
        assert_eq!(cfg.agent_loop.verification_reserve, 4);
    }

    #[test]
    fn verifier_model_falls_back_to_main_model() {
        let mut cfg = LlmConfig::default();
        assert_eq!(cfg.verifier_model(), cfg.model.clone());
        cfg.verifier_model = "checker".to_string();
        assert_eq!(cfg.verifier_model(), "checker");
    }
}
