use anyhow::{anyhow, Result};
use pilot_core::{compact_json, ChatMessage, LlmConfig};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::thread;
use std::time::Duration;

/// Base delay for retry backoff (500ms, 1s, 2s).
const RETRY_BASE_MS: u64 = 500;

const VERIFIER_MAX_TOKENS: u32 = 300;

const VERIFIER_SYSTEM_PROMPT: &str = "You are a cautious code verifier bot.
Given a user request, changed files, and verification outputs, assess whether the changes appear correct.
Respond in plain text with:
1) Verdict: PASS / NEEDS_REVIEW
2) Why (1-3 bullets)
3) Any risky assumptions or missing checks
Keep it concise.
";

/// One blocking completion round trip. `json_object` requests structured
/// output mode for action decoding; the verifier call leaves it off.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub json_object: bool,
}

pub trait LlmClient {
    fn complete(&self, req: &CompletionRequest) -> Result<String>;
}

pub struct OpenAiClient {
    cfg: LlmConfig,
    client: Client,
}

impl OpenAiClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn api_key(&self) -> Result<String> {
        std::env::var(&self.cfg.api_key_env)
            .map_err(|_| anyhow!("API key not set: export {}", self.cfg.api_key_env))
    }
}

impl LlmClient for OpenAiClient {
    fn complete(&self, req: &CompletionRequest) -> Result<String> {
        let api_key = self.api_key()?;
        let payload = build_payload(req);

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(&api_key)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text()?;
                    if status.is_success() {
                        return extract_content(&body);
                    }
                    last_err = Some(anyhow!(
                        "model API error (status {status}): {}",
                        pilot_core::clip(&body, 400)
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(attempt));
                        attempt += 1;
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(anyhow!("model request failed: {e}"));
                    if attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(attempt));
                        attempt += 1;
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("model request failed without detail")))
    }
}

fn build_payload(req: &CompletionRequest) -> Value {
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect();
    let mut payload = json!({
        "model": req.model,
        "messages": messages,
        "temperature": 0.0,
        "max_tokens": req.max_tokens,
    });
    if req.json_object {
        payload["response_format"] = json!({"type": "json_object"});
    }
    payload
}

fn extract_content(body: &str) -> Result<String> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| anyhow!("unparseable model response body: {e}"))?;
    let content = value["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| anyhow!("model response missing choices[0].message.content"))?;
    Ok(content.trim().to_string())
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_delay(attempt: u8) -> Duration {
    Duration::from_millis(RETRY_BASE_MS << attempt.min(4))
}

/// Advisory second-opinion call. Failures are folded into the returned string
/// rather than propagated; the loop must never die because the verifier did.
pub fn run_verifier_bot(
    client: &dyn LlmClient,
    cfg: &LlmConfig,
    user_request: &str,
    edited_files: &[String],
    verify_result: Option<&Value>,
    context_snippet: &str,
) -> String {
    let verify_summary = verify_result.map(compact_json).unwrap_or_else(|| "none".to_string());
    let context = if context_snippet.is_empty() {
        "none"
    } else {
        context_snippet
    };
    let verifier_input = format!(
        "User request: {user_request}\n\
         Edited files: {edited_files:?}\n\
         Compile verification: {verify_summary}\n\
         Recent context:\n{context}\n"
    );
    let request = CompletionRequest {
        model: cfg.verifier_model().to_string(),
        messages: vec![
            ChatMessage::system(VERIFIER_SYSTEM_PROMPT),
            ChatMessage::user(verifier_input),
        ],
        max_tokens: VERIFIER_MAX_TOKENS,
        json_object: false,
    };
    match client.complete(&request) {
        Ok(text) if text.is_empty() => "Verifier returned empty response.".to_string(),
        Ok(text) => text,
        Err(e) => format!("Verifier bot failed: {e}"),
    }
}
