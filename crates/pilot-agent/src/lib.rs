mod heuristics;
mod normalize;
mod parse;
mod verify;

pub use heuristics::{
    derive_pattern_from_request, extract_first_file_path, is_progress_only_message,
    repair_tool_args,
};
pub use normalize::normalize_action;
pub use parse::{extract_json, ParseError};
pub use verify::{auto_verify, CheckOutcome, VerificationReport};

use anyhow::{anyhow, Result};
use pilot_core::{
    clip, compact_json, registry_json, Action, AgentConfig, ChatMessage, Role, StepBudget,
    ToolName, ToolResult,
};
use pilot_llm::{run_verifier_bot, CompletionRequest, LlmClient, OpenAiClient};
use pilot_observe::Observer;
use pilot_store::SessionStore;
use pilot_tools::Sandbox;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const SYSTEM_PROMPT: &str = r#"You are a pragmatic local coding agent.
You can either reply to the user or call exactly one tool at a time.
Always return a JSON object with this schema:
{"type":"message","content":"..."} OR {"type":"tool","name":"tool_name","args":{...}}
Rules:
- Use tools before making assumptions.
- Keep tool args valid for the schema.
- Prefer `patch_file` over `write_file` for targeted edits to keep responses small and reliable.
- Never output markdown fences.
- Do not output planning/status-only messages like "I will now...".
- If the user asks for code changes, execute them directly using tools in this turn.
- After successful code edits (`write_file` or `patch_file`), run verification.
- If done, return type=message with a concise answer.
Available tools:
"#;

const PARSE_CORRECTION: &str = "Your previous response was not valid JSON. \
Return exactly one JSON object now with schema \
{\"type\":\"message\",\"content\":\"...\"} OR {\"type\":\"tool\",\"name\":\"tool_name\",\"args\":{...}}. \
No extra text.";

const REDUCED_CONTEXT_INSTRUCTION: &str = "If you need to edit code, use patch_file with small \
find/replace chunks. Do not send large full-file content.";

const CONTINUE_INSTRUCTION: &str = "Continue now and execute concrete tool actions. \
Do not ask for confirmation. Only return final message after edits + verification.";

const RETRY_MAX_TOKENS: u32 = 700;
const REDUCED_MAX_TOKENS: u32 = 500;
const PARSE_DETAIL_CLIP_CHARS: usize = 220;
const RESULT_FIELD_CLIP_CHARS: usize = 1500;
const RESULT_LIST_CAP: usize = 40;
const SHORT_JSON_CHARS: usize = 1200;
const VERIFIER_CONTEXT_ITEMS: usize = 8;
const VERIFIER_CONTEXT_CLIP_CHARS: usize = 220;

pub type ToolStepCallback = Arc<dyn Fn(u32, &str)>;
pub type DiagnosticCallback = Arc<dyn Fn(&str)>;

/// Progress hooks surfaced to the presentation layer. All optional; the loop
/// never depends on them being wired.
#[derive(Clone, Default)]
pub struct LoopEvents {
    pub on_tool_step: Option<ToolStepCallback>,
    pub on_tool_error: Option<DiagnosticCallback>,
    pub on_verify_error: Option<DiagnosticCallback>,
    pub on_info: Option<DiagnosticCallback>,
}

impl LoopEvents {
    fn tool_step(&self, step: u32, tool: &str) {
        if let Some(cb) = &self.on_tool_step {
            cb(step, tool);
        }
    }

    fn tool_error(&self, msg: &str) {
        if let Some(cb) = &self.on_tool_error {
            cb(msg);
        }
    }

    fn verify_error(&self, msg: &str) {
        if let Some(cb) = &self.on_verify_error {
            cb(msg);
        }
    }

    fn info(&self, msg: &str) {
        if let Some(cb) = &self.on_info {
            cb(msg);
        }
    }
}

/// The action loop: one engine instance owns everything a turn mutates, so a
/// turn needs no locking and no shared state beyond the session store.
pub struct AgentEngine {
    cfg: AgentConfig,
    store: SessionStore,
    llm: Box<dyn LlmClient>,
    sandbox: Sandbox,
    observer: Observer,
    events: LoopEvents,
}

impl AgentEngine {
    pub fn new(workspace: &Path) -> Result<Self> {
        let cfg = AgentConfig::ensure(workspace)?;
        Self::with_config(workspace, cfg)
    }

    /// Build with an explicit configuration and the real HTTP-backed client.
    pub fn with_config(workspace: &Path, cfg: AgentConfig) -> Result<Self> {
        let llm = Box::new(OpenAiClient::new(cfg.llm.clone())?);
        Self::with_components(workspace, cfg, llm)
    }

    pub fn with_components(
        workspace: &Path,
        cfg: AgentConfig,
        llm: Box<dyn LlmClient>,
    ) -> Result<Self> {
        let store = SessionStore::new(workspace)?;
        let sandbox = Sandbox::new(
            workspace,
            Duration::from_secs(cfg.agent_loop.shell_timeout_seconds),
        )?;
        let observer = Observer::new(workspace)?;
        Ok(Self {
            cfg,
            store,
            llm,
            sandbox,
            observer,
            events: LoopEvents::default(),
        })
    }

    pub fn set_events(&mut self, events: LoopEvents) {
        self.events = events;
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.observer.set_verbose(verbose);
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn cfg(&self) -> &AgentConfig {
        &self.cfg
    }

    /// Process one user instruction to a terminal outcome. Every return path
    /// persists exactly one assistant message for the turn.
    pub fn run_once(&self, session_id: &str, user_input: &str) -> Result<String> {
        let loop_cfg = &self.cfg.agent_loop;
        let budget = StepBudget::new(loop_cfg.max_steps, loop_cfg.verification_reserve);
        self.observer.info(&format!(
            "turn start: session={session_id} budget={}/{}",
            budget.execution_limit, budget.total
        ));

        let mut history = vec![ChatMessage::system(format!(
            "{SYSTEM_PROMPT}{}",
            compact_json(&registry_json())
        ))];
        for message in self.store.load(session_id, loop_cfg.history_tail)? {
            history.push(ChatMessage {
                role: message.role,
                content: clip(&message.content, loop_cfg.history_clip_chars),
            });
        }

        self.store.append(session_id, Role::User, user_input)?;
        history.push(ChatMessage::user(user_input));

        let mut edited_files: Vec<String> = Vec::new();
        let mut latest_verify: Option<VerificationReport> = None;
        let mut repeated_errors: HashMap<(String, String), u32> = HashMap::new();

        for step in 0..budget.execution_limit {
            let action_value = match self.model_step(&history) {
                Ok(value) => normalize_action(value),
                Err(e) => {
                    return self.finish(session_id, e.to_string());
                }
            };

            let action = match validate_action(&action_value) {
                Ok(action) => action,
                Err(ActionIssue::InvalidMessage(detail)) => {
                    return self.finish(session_id, format!("Invalid message action: {detail}"));
                }
                Err(ActionIssue::UnknownType) => {
                    return self.finish(
                        session_id,
                        format!(
                            "Unknown action type from model: {}",
                            compact_json(&action_value)
                        ),
                    );
                }
                Err(ActionIssue::InvalidTool { tool, detail }) => {
                    let tool_result = ToolResult::failure(&tool, format!("Invalid tool action: {detail}"));
                    history.push(ChatMessage::assistant(compact_json(&action_value)));
                    history.push(ChatMessage::user(format!(
                        "Tool result: {}",
                        compact_json(&serde_json::to_value(&tool_result)?)
                    )));
                    self.events.tool_error(&short_json(&serde_json::to_value(&tool_result)?));
                    continue;
                }
            };

            match action {
                Action::Message { content } => {
                    if is_progress_only_message(&content) {
                        // Narrated intent is not an outcome; push back and
                        // keep the loop running.
                        history.push(ChatMessage::assistant(content));
                        history.push(ChatMessage::user(CONTINUE_INSTRUCTION));
                        continue;
                    }

                    let mut final_message = content;
                    if !edited_files.is_empty() {
                        let summary = verifier_summary(latest_verify.as_ref());
                        let context = build_verifier_context(&history);
                        let verifier = run_verifier_bot(
                            self.llm.as_ref(),
                            &self.cfg.llm,
                            user_input,
                            &edited_files,
                            Some(&summary),
                            &context,
                        );
                        final_message = format!("{final_message}\n\nVerifier Bot:\n{verifier}");
                    }
                    return self.finish(session_id, final_message);
                }
                Action::Tool { name, args } => {
                    let repaired = match ToolName::from_name(&name) {
                        Some(tool) => repair_tool_args(tool, &args, user_input),
                        None => args.clone(),
                    };
                    let tool_result = self.dispatch_guarded(&name, &repaired);

                    let compacted = compact_tool_result(&tool_result);
                    history.push(ChatMessage::assistant(compact_json(&action_value)));
                    history.push(ChatMessage::user(format!(
                        "Tool result: {}",
                        clip(&compact_json(&compacted), loop_cfg.tool_result_clip_chars)
                    )));
                    self.events.tool_step(step + 1, &name);

                    if !tool_result.ok {
                        let error_text = tool_result.error.clone().unwrap_or_else(|| "unknown".to_string());
                        self.events.tool_error(&short_json(&json!({
                            "step": step + 1,
                            "tool": name,
                            "args": args,
                            "error": error_text,
                        })));

                        let required = ToolName::from_name(&name)
                            .map(|t| t.required_args())
                            .unwrap_or(&[]);
                        if !required.is_empty() && error_text.contains("Missing required argument")
                        {
                            history.push(ChatMessage::user(format!(
                                "Tool call correction: `{name}` requires args {required:?}. \
                                 Retry with valid args immediately."
                            )));
                        }

                        let count = repeated_errors
                            .entry((name.clone(), error_text.clone()))
                            .or_insert(0);
                        *count += 1;
                        if *count >= loop_cfg.repeat_failure_threshold {
                            self.observer.warn(&format!(
                                "circuit breaker tripped: tool={name} error={error_text}"
                            ));
                            return self.finish(
                                session_id,
                                format!(
                                    "Aborted repeated failing tool call: {name}. \
                                     Last error: {error_text}. \
                                     Try /reset and rephrase with explicit file path."
                                ),
                            );
                        }
                        continue;
                    }

                    if ToolName::from_name(&name).is_some_and(|t| t.is_edit()) {
                        if let Some(path) = tool_result
                            .result
                            .as_ref()
                            .and_then(|r| r.get("path"))
                            .and_then(Value::as_str)
                        {
                            if !path.is_empty() && !edited_files.iter().any(|p| p == path) {
                                edited_files.push(path.to_string());
                            }
                        }
                        latest_verify = Some(self.run_auto_verify(&mut history, "auto_verify"));
                    }
                }
            }
        }

        // Reserved finalization phase: one guaranteed verification +
        // summarization pass even when the model edited until the budget ran
        // out.
        let timeout_message = if edited_files.is_empty() {
            format!(
                "Stopped after execution budget of {} steps (reserved {} for \
                 verification/finalization) without a final answer.",
                budget.execution_limit, budget.reserved
            )
        } else {
            if latest_verify.is_none() {
                latest_verify = Some(self.run_auto_verify(&mut history, "reserved verification phase"));
            }
            let summary = verifier_summary(latest_verify.as_ref());
            let context = build_verifier_context(&history);
            let verifier = run_verifier_bot(
                self.llm.as_ref(),
                &self.cfg.llm,
                user_input,
                &edited_files,
                Some(&summary),
                &context,
            );
            format!(
                "Stopped after {} steps without a final answer.\n\nVerifier Bot:\n{verifier}",
                budget.total
            )
        };
        self.finish(session_id, timeout_message)
    }

    /// Persist the terminal assistant message and hand it back.
    fn finish(&self, session_id: &str, message: String) -> Result<String> {
        self.store.append(session_id, Role::Assistant, &message)?;
        self.observer.info(&format!("turn end: session={session_id}"));
        Ok(message)
    }

    /// Tool dispatch with a last-resort panic guard: truly unexpected faults
    /// become generic failed results instead of killing the turn.
    fn dispatch_guarded(&self, name: &str, args: &Map<String, Value>) -> ToolResult {
        match catch_unwind(AssertUnwindSafe(|| self.sandbox.dispatch(name, args))) {
            Ok(Ok(result)) => ToolResult::success(name, result),
            Ok(Err(e)) => ToolResult::failure(name, e.to_string()),
            Err(_) => ToolResult::failure(name, "Unexpected tool error."),
        }
    }

    fn run_auto_verify(&self, history: &mut Vec<ChatMessage>, label: &str) -> VerificationReport {
        let report = auto_verify(&self.sandbox, &self.cfg.verify);
        let mut payload = json!({
            "ok": report.overall_pass,
            "tool": "auto_verify",
            "result": report.to_json(),
        });
        compact_result_fields(&mut payload);
        history.push(ChatMessage::user(format!(
            "Tool result: {}",
            clip(
                &compact_json(&payload),
                self.cfg.agent_loop.tool_result_clip_chars
            )
        )));
        self.events.info(&format!(
            "{label}: {} && {}",
            self.cfg.verify.compile_command, self.cfg.verify.behavior_command
        ));
        if !report.overall_pass {
            self.observer.warn("verification failed after edit");
            self.events.verify_error(&short_json(&report.to_json()));
        }
        report
    }

    /// One action request with the three-attempt parse retry ladder. An API
    /// failure on the first attempt is terminal; later attempts fall through
    /// to the next rung.
    fn model_step(&self, history: &[ChatMessage]) -> Result<Value> {
        let model = self.cfg.llm.model.clone();
        let raw = self
            .request(history.to_vec(), self.cfg.llm.max_tokens)
            .map_err(|e| anyhow!("Model/API error for `{model}`: {e}"))?;
        let first_err = match extract_json(&raw) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let mut retry = history.to_vec();
        retry.push(ChatMessage::user(PARSE_CORRECTION));
        if let Ok(raw) = self.request(retry, RETRY_MAX_TOKENS) {
            if let Ok(value) = extract_json(&raw) {
                return Ok(value);
            }
        }

        // Last resort: shrink to the system preamble plus the two most recent
        // entries to avoid truncated JSON from an overlong response.
        let tail_start = history.len().saturating_sub(2);
        let mut reduced = vec![history[0].clone()];
        reduced.extend(history[tail_start..].iter().cloned());
        reduced.push(ChatMessage::user(REDUCED_CONTEXT_INSTRUCTION));
        if let Ok(raw) = self.request(reduced, REDUCED_MAX_TOKENS) {
            if let Ok(value) = extract_json(&raw) {
                return Ok(value);
            }
        }

        Err(anyhow!(
            "Model response was not valid JSON. Parse detail: {}",
            clip(&first_err.to_string(), PARSE_DETAIL_CLIP_CHARS)
        ))
    }

    fn request(&self, messages: Vec<ChatMessage>, max_tokens: u32) -> Result<String> {
        self.llm.complete(&CompletionRequest {
            model: self.cfg.llm.model.clone(),
            messages,
            max_tokens,
            json_object: true,
        })
    }
}

#[derive(Debug)]
enum ActionIssue {
    /// Terminal for the turn, mirroring the original behavior for broken
    /// final messages.
    InvalidMessage(String),
    /// Recoverable: folded into history as a failed tool result.
    InvalidTool { tool: String, detail: String },
    /// Terminal: the model invented an action kind we never offered.
    UnknownType,
}

fn validate_action(value: &Value) -> Result<Action, ActionIssue> {
    let Some(obj) = value.as_object() else {
        return Err(ActionIssue::UnknownType);
    };
    match obj.get("type").and_then(Value::as_str) {
        Some("message") => match obj.get("content") {
            Some(Value::String(content)) => Ok(Action::Message {
                content: content.clone(),
            }),
            _ => Err(ActionIssue::InvalidMessage(
                "`content` must be a string.".to_string(),
            )),
        },
        Some("tool") => {
            let Some(name) = obj.get("name").and_then(Value::as_str) else {
                return Err(ActionIssue::InvalidTool {
                    tool: "unknown".to_string(),
                    detail: "`name` must be a string.".to_string(),
                });
            };
            let args = match obj.get("args") {
                None | Some(Value::Null) => Map::new(),
                Some(Value::Object(map)) => map.clone(),
                Some(_) => {
                    return Err(ActionIssue::InvalidTool {
                        tool: name.to_string(),
                        detail: "`args` must be an object.".to_string(),
                    })
                }
            };
            Ok(Action::Tool {
                name: name.to_string(),
                args,
            })
        }
        _ => Err(ActionIssue::UnknownType),
    }
}

/// Clip oversized string fields and cap oversized list fields inside a tool
/// result payload before it enters history.
fn compact_result_fields(payload: &mut Value) {
    let Some(result) = payload.get_mut("result").and_then(Value::as_object_mut) else {
        return;
    };
    for key in ["stdout", "stderr", "content"] {
        let clipped = match result.get(key) {
            Some(Value::String(s)) => Some(clip(s, RESULT_FIELD_CLIP_CHARS)),
            _ => None,
        };
        if let Some(clipped) = clipped {
            result.insert(key.to_string(), Value::String(clipped));
        }
    }
    for key in ["files", "matches"] {
        let capped = match result.get(key) {
            Some(Value::Array(items)) if items.len() > RESULT_LIST_CAP => {
                Some((items[..RESULT_LIST_CAP].to_vec(), items.len() - RESULT_LIST_CAP))
            }
            _ => None,
        };
        if let Some((items, overflow)) = capped {
            result.insert(key.to_string(), Value::Array(items));
            result.insert(format!("{key}_truncated"), json!(overflow));
        }
    }
}

fn compact_tool_result(tool_result: &ToolResult) -> Value {
    let mut payload = serde_json::to_value(tool_result).unwrap_or(Value::Null);
    compact_result_fields(&mut payload);
    payload
}

fn verifier_summary(report: Option<&VerificationReport>) -> Value {
    let mut wrapper = json!({
        "result": report.map(VerificationReport::to_json).unwrap_or_else(|| json!({})),
    });
    compact_result_fields(&mut wrapper);
    wrapper["result"].take()
}

fn build_verifier_context(history: &[ChatMessage]) -> String {
    history
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .rev()
        .take(VERIFIER_CONTEXT_ITEMS)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .map(|m| {
            format!(
                "{}: {}",
                m.role.as_str(),
                clip(&m.content, VERIFIER_CONTEXT_CLIP_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn short_json(value: &Value) -> String {
    clip(&compact_json(value), SHORT_JSON_CHARS)
}
