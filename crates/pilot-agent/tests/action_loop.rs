//! End-to-end turns against a scripted model: every terminal outcome of the
//! loop, with a real sandbox and session store underneath.

use pilot_agent::AgentEngine;
use pilot_core::{AgentConfig, Role};
use pilot_llm::CompletionRequest;
use pilot_testkit::{FailingLlm, ScriptedLlm, WorkspaceFixture};
use std::sync::{Arc, Mutex};

type RequestLog = Arc<Mutex<Vec<CompletionRequest>>>;

fn quiet_config() -> AgentConfig {
    let mut cfg = AgentConfig::default();
    cfg.verify.compile_command = "true".to_string();
    cfg.verify.behavior_command = "true".to_string();
    cfg
}

fn scripted_engine(
    fx: &WorkspaceFixture,
    cfg: AgentConfig,
    responses: &[&str],
) -> (AgentEngine, RequestLog) {
    let llm = ScriptedLlm::new(responses.iter().copied());
    let requests = llm.requests_handle();
    let engine = AgentEngine::with_components(fx.path(), cfg, Box::new(llm)).unwrap();
    (engine, requests)
}

#[test]
fn plain_message_terminates_and_persists_the_turn() {
    let fx = WorkspaceFixture::new().unwrap();
    let (engine, requests) = scripted_engine(
        &fx,
        quiet_config(),
        &[r#"{"type":"message","content":"2 + 2 is 4."}"#],
    );
    let session = fx.session_id();

    let reply = engine.run_once(&session, "what is 2 + 2?").unwrap();
    assert_eq!(reply, "2 + 2 is 4.");
    assert_eq!(requests.lock().unwrap().len(), 1);

    let persisted = engine.store().load(&session, 10).unwrap();
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted[0].role, Role::User);
    assert_eq!(persisted[0].content, "what is 2 + 2?");
    assert_eq!(persisted[1].role, Role::Assistant);
    assert_eq!(persisted[1].content, "2 + 2 is 4.");
}

#[test]
fn progress_only_message_is_pushed_back_into_the_loop() {
    let fx = WorkspaceFixture::new().unwrap();
    let (engine, requests) = scripted_engine(
        &fx,
        quiet_config(),
        &[
            // fenced and progress-only at the same time
            "```json\n{\"type\":\"message\",\"content\":\"I will now inspect the repository.\"}\n```",
            r#"{"type":"message","content":"Nothing needs changing; summary: repo is clean."}"#,
        ],
    );

    let reply = engine.run_once(&fx.session_id(), "check the repo").unwrap();
    assert_eq!(reply, "Nothing needs changing; summary: repo is clean.");

    let seen = requests.lock().unwrap();
    assert_eq!(seen.len(), 2);
    let second_turn = &seen[1].messages;
    assert!(second_turn
        .iter()
        .any(|m| m.content.contains("Continue now and execute concrete tool actions")));
}

#[test]
fn edit_triggers_auto_verify_and_final_answer_gets_verifier_appendix() {
    let fx = WorkspaceFixture::new().unwrap();
    fx.write_file("app.py", "magic = 1\n").unwrap();
    let (engine, requests) = scripted_engine(
        &fx,
        quiet_config(),
        &[
            r#"{"type":"tool","name":"patch_file","args":{"path":"app.py","find":"magic = 1","replace":"magic = 2"}}"#,
            r#"{"type":"message","content":"Updated the constant."}"#,
            "Verdict: PASS\n- change matches the request",
        ],
    );

    let reply = engine
        .run_once(&fx.session_id(), "bump magic to 2 in app.py")
        .unwrap();
    assert!(reply.starts_with("Updated the constant."));
    assert!(reply.contains("\n\nVerifier Bot:\nVerdict: PASS"));
    assert_eq!(fx.read_file("app.py").unwrap(), "magic = 2\n");

    let seen = requests.lock().unwrap();
    assert_eq!(seen.len(), 3);
    // the model saw both the patch result and the verification result
    let final_turn = &seen[1].messages;
    assert!(final_turn
        .iter()
        .any(|m| m.content.contains(r#""tool":"patch_file""#)));
    assert!(final_turn
        .iter()
        .any(|m| m.content.contains(r#""tool":"auto_verify""#)));
}

#[test]
fn failed_verification_is_reported_but_not_fatal() {
    let fx = WorkspaceFixture::new().unwrap();
    fx.write_file("app.py", "magic = 1\n").unwrap();
    let mut cfg = quiet_config();
    cfg.verify.behavior_command = "false".to_string();
    let (engine, _requests) = scripted_engine(
        &fx,
        cfg,
        &[
            r#"{"type":"tool","name":"patch_file","args":{"path":"app.py","find":"magic = 1","replace":"magic = 2"}}"#,
            r#"{"type":"message","content":"Updated, but checks are unhappy."}"#,
            "Verdict: NEEDS_REVIEW",
        ],
    );

    let reply = engine.run_once(&fx.session_id(), "bump magic").unwrap();
    assert!(reply.starts_with("Updated, but checks are unhappy."));
    assert!(reply.contains("Verifier Bot:\nVerdict: NEEDS_REVIEW"));
}

#[test]
fn circuit_breaker_aborts_on_third_identical_failure() {
    let fx = WorkspaceFixture::new().unwrap();
    let bad_call = r#"{"type":"tool","name":"read_file","args":{"path":"missing.txt"}}"#;
    let (engine, requests) = scripted_engine(&fx, quiet_config(), &[bad_call, bad_call, bad_call]);

    let reply = engine.run_once(&fx.session_id(), "read missing.txt").unwrap();
    assert!(reply.contains("Aborted repeated failing tool call: read_file."));
    assert!(reply.contains("Try /reset and rephrase"));
    assert_eq!(requests.lock().unwrap().len(), 3);
}

#[test]
fn differing_failures_do_not_trip_the_breaker() {
    let fx = WorkspaceFixture::new().unwrap();
    let (engine, _requests) = scripted_engine(
        &fx,
        quiet_config(),
        &[
            r#"{"type":"tool","name":"read_file","args":{"path":"missing_one.txt"}}"#,
            r#"{"type":"tool","name":"read_file","args":{"path":"missing_two.txt"}}"#,
            r#"{"type":"tool","name":"read_file","args":{"path":"missing_three.txt"}}"#,
            r#"{"type":"message","content":"None of those files exist."}"#,
        ],
    );

    let reply = engine.run_once(&fx.session_id(), "read some files").unwrap();
    assert_eq!(reply, "None of those files exist.");
}

#[test]
fn parse_failure_is_terminal_after_retry_ladder() {
    let fx = WorkspaceFixture::new().unwrap();
    let (engine, requests) = scripted_engine(
        &fx,
        quiet_config(),
        &["I think we should...", "still not json", "nope"],
    );
    let session = fx.session_id();

    let reply = engine.run_once(&session, "do something").unwrap();
    assert!(reply.starts_with("Model response was not valid JSON. Parse detail:"));

    let seen = requests.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[1].max_tokens, 700);
    assert!(seen[1]
        .messages
        .iter()
        .any(|m| m.content.contains("was not valid JSON")));
    // reduced-context attempt: system preamble + two most recent + instruction
    assert_eq!(seen[2].max_tokens, 500);
    assert_eq!(seen[2].messages.len(), 4);
    assert!(seen[2]
        .messages
        .iter()
        .any(|m| m.content.contains("small find/replace chunks")));

    // exactly one assistant row persisted for the failed turn
    let persisted = engine.store().load(&session, 10).unwrap();
    let assistant_rows: Vec<_> = persisted
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .collect();
    assert_eq!(assistant_rows.len(), 1);
}

#[test]
fn api_error_on_first_attempt_is_terminal() {
    let fx = WorkspaceFixture::new().unwrap();
    let engine =
        AgentEngine::with_components(fx.path(), quiet_config(), Box::new(FailingLlm)).unwrap();

    let reply = engine.run_once(&fx.session_id(), "hello").unwrap();
    assert!(reply.starts_with("Model/API error for `gpt-5.1`:"));
    assert!(reply.contains("connection refused"));
}

#[test]
fn unknown_action_type_is_terminal() {
    let fx = WorkspaceFixture::new().unwrap();
    let (engine, requests) = scripted_engine(
        &fx,
        quiet_config(),
        &[r#"{"type":"self_destruct","payload":"now"}"#],
    );

    let reply = engine.run_once(&fx.session_id(), "hello").unwrap();
    assert!(reply.starts_with("Unknown action type from model:"));
    assert!(reply.contains("self_destruct"));
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[test]
fn invalid_tool_action_is_folded_and_loop_continues() {
    let fx = WorkspaceFixture::new().unwrap();
    let (engine, requests) = scripted_engine(
        &fx,
        quiet_config(),
        &[
            r#"{"type":"tool","name":7,"args":{}}"#,
            r#"{"type":"message","content":"Recovered."}"#,
        ],
    );

    let reply = engine.run_once(&fx.session_id(), "hello").unwrap();
    assert_eq!(reply, "Recovered.");

    let seen = requests.lock().unwrap();
    assert!(seen[1]
        .messages
        .iter()
        .any(|m| m.content.contains("Invalid tool action")));
}

#[test]
fn unknown_tool_name_is_a_recoverable_failure() {
    let fx = WorkspaceFixture::new().unwrap();
    let (engine, requests) = scripted_engine(
        &fx,
        quiet_config(),
        &[
            r#"{"type":"tool","name":"teleport","args":{}}"#,
            r#"{"type":"message","content":"Sticking to real tools."}"#,
        ],
    );

    let reply = engine.run_once(&fx.session_id(), "hello").unwrap();
    assert_eq!(reply, "Sticking to real tools.");
    assert!(requests.lock().unwrap()[1]
        .messages
        .iter()
        .any(|m| m.content.contains("Unknown tool: teleport")));
}

#[test]
fn budget_exhaustion_without_edits_reports_the_reserve() {
    let fx = WorkspaceFixture::new().unwrap();
    let mut cfg = quiet_config();
    cfg.agent_loop.max_steps = 3;
    cfg.agent_loop.verification_reserve = 1;
    let list_call = r#"{"type":"tool","name":"list_files","args":{}}"#;
    let (engine, requests) = scripted_engine(&fx, cfg, &[list_call, list_call]);

    let reply = engine.run_once(&fx.session_id(), "browse forever").unwrap();
    assert_eq!(
        reply,
        "Stopped after execution budget of 2 steps (reserved 1 for \
         verification/finalization) without a final answer."
    );
    assert_eq!(requests.lock().unwrap().len(), 2);
}

#[test]
fn budget_exhaustion_with_edits_still_runs_the_verifier() {
    let fx = WorkspaceFixture::new().unwrap();
    let mut cfg = quiet_config();
    cfg.agent_loop.max_steps = 3;
    cfg.agent_loop.verification_reserve = 1;
    let (engine, _requests) = scripted_engine(
        &fx,
        cfg,
        &[
            r#"{"type":"tool","name":"write_file","args":{"path":"note.txt","content":"hi"}}"#,
            r#"{"type":"tool","name":"list_files","args":{}}"#,
            "Verdict: NEEDS_REVIEW\n- turn never concluded",
        ],
    );

    let reply = engine.run_once(&fx.session_id(), "write a note").unwrap();
    assert!(reply.starts_with("Stopped after 3 steps without a final answer."));
    assert!(reply.contains("Verifier Bot:\nVerdict: NEEDS_REVIEW"));
    assert_eq!(fx.read_file("note.txt").unwrap(), "hi");
}

#[test]
fn missing_path_is_repaired_from_the_user_request() {
    let fx = WorkspaceFixture::new().unwrap();
    fx.write_file("foo.py", "value = 42\n").unwrap();
    let (engine, requests) = scripted_engine(
        &fx,
        quiet_config(),
        &[
            r#"{"type":"tool","name":"read_file","args":{}}"#,
            r#"{"type":"message","content":"foo.py sets value to 42."}"#,
        ],
    );

    let reply = engine
        .run_once(&fx.session_id(), "read foo.py and summarize it")
        .unwrap();
    assert_eq!(reply, "foo.py sets value to 42.");

    let seen = requests.lock().unwrap();
    let tool_result = seen[1]
        .messages
        .iter()
        .find(|m| m.content.starts_with("Tool result:"))
        .expect("tool result folded into history");
    assert!(tool_result.content.contains(r#""ok":true"#));
    assert!(tool_result.content.contains("value = 42"));
}

#[test]
fn unrepairable_missing_arg_gets_a_correction_message() {
    let fx = WorkspaceFixture::new().unwrap();
    let (engine, requests) = scripted_engine(
        &fx,
        quiet_config(),
        &[
            r#"{"type":"tool","name":"read_file","args":{}}"#,
            r#"{"type":"message","content":"I need a file name."}"#,
        ],
    );

    let reply = engine.run_once(&fx.session_id(), "just do the thing").unwrap();
    assert_eq!(reply, "I need a file name.");

    let seen = requests.lock().unwrap();
    assert!(seen[1]
        .messages
        .iter()
        .any(|m| m.content.contains("Tool call correction: `read_file` requires args")));
}

#[test]
fn bare_tool_shape_is_normalized_and_dispatched() {
    let fx = WorkspaceFixture::new().unwrap();
    fx.write_file("a.txt", "x").unwrap();
    let (engine, requests) = scripted_engine(
        &fx,
        quiet_config(),
        &[
            // model answered with the tool name as the type, a shape the
            // normalizer folds into a canonical tool action
            r#"{"type":"list_files","args":{}}"#,
            r#"{"type":"message","content":"One file."}"#,
        ],
    );

    let reply = engine.run_once(&fx.session_id(), "what is here?").unwrap();
    assert_eq!(reply, "One file.");
    assert!(requests.lock().unwrap()[1]
        .messages
        .iter()
        .any(|m| m.content.contains(r#""tool":"list_files""#) && m.content.contains("a.txt")));
}

#[test]
fn fenced_json_responses_are_accepted() {
    let fx = WorkspaceFixture::new().unwrap();
    let (engine, requests) = scripted_engine(
        &fx,
        quiet_config(),
        &["```json\n{\"type\":\"message\",\"content\":\"fenced but fine\"}\n```"],
    );

    let reply = engine.run_once(&fx.session_id(), "hello").unwrap();
    assert_eq!(reply, "fenced but fine");
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[test]
fn session_history_is_reseeded_on_the_next_turn() {
    let fx = WorkspaceFixture::new().unwrap();
    let session = fx.session_id();
    {
        let (engine, _) = scripted_engine(
            &fx,
            quiet_config(),
            &[r#"{"type":"message","content":"Call me Pilot."}"#],
        );
        engine.run_once(&session, "pick a name").unwrap();
    }

    let (engine, requests) = scripted_engine(
        &fx,
        quiet_config(),
        &[r#"{"type":"message","content":"Pilot, as agreed."}"#],
    );
    let reply = engine.run_once(&session, "what was the name?").unwrap();
    assert_eq!(reply, "Pilot, as agreed.");

    let seen = requests.lock().unwrap();
    assert!(seen[0]
        .messages
        .iter()
        .any(|m| m.content.contains("Call me Pilot.")));
}
