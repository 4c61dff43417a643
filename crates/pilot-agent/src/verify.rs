//! Post-edit verification: a static validity check plus a behavioral check,
//! both external commands run through the sandbox (policy guard included).
//! Only exit codes and captured output are consumed.

use pilot_core::VerifyConfig;
use pilot_tools::Sandbox;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub pass: bool,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub compile: CheckOutcome,
    pub behavior: CheckOutcome,
    pub overall_pass: bool,
}

impl VerificationReport {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub fn auto_verify(sandbox: &Sandbox, cfg: &VerifyConfig) -> VerificationReport {
    let compile = run_check(sandbox, &cfg.compile_command);
    let behavior = run_check(sandbox, &cfg.behavior_command);
    let overall_pass = compile.pass && behavior.pass;
    VerificationReport {
        compile,
        behavior,
        overall_pass,
    }
}

fn run_check(sandbox: &Sandbox, command: &str) -> CheckOutcome {
    match sandbox.run_shell(command) {
        Ok(result) => CheckOutcome {
            pass: result["returncode"] == 0,
            result,
        },
        // Timeouts and policy rejections count as failed checks, not crashes.
        Err(e) => CheckOutcome {
            pass: false,
            result: json!({"command": command, "error": e.to_string()}),
        },
    }
}
