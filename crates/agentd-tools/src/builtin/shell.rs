// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(unix)]
use libc;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use agentd_policy::{Ruleset, Verdict};

use crate::tool::{PreUseDecision, Tool, ToolContext, ToolOutput};

/// Built-in tool that runs a shell command, gated by the allowlist.
pub struct ExecuteShellTool {
    ruleset: Arc<Ruleset>,
    pub timeout_secs: u64,
}

impl ExecuteShellTool {
    pub fn new(ruleset: Arc<Ruleset>, timeout_secs: u64) -> Self {
        Self {
            ruleset,
            timeout_secs,
        }
    }
}

#[async_trait]
impl Tool for ExecuteShellTool {
    fn name(&self) -> &str {
        "execute_shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         'command' is required and can be any bash one-liner.\n\
         Prefer non-interactive commands; for long-lived or interactive\n\
         programs use a PTY session instead."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory (optional)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    /// Allowlist gate: approved commands run, denied ones are refused,
    /// everything else asks a human.
    fn pre_use(&self, args: &Value, ctx: &ToolContext) -> PreUseDecision {
        if ctx.approval_grant {
            return PreUseDecision::Allow;
        }
        let command = args.get("command").and_then(Value::as_str).unwrap_or("");
        let decision = self.ruleset.evaluate(command);
        match decision.verdict {
            Verdict::Approve => PreUseDecision::Allow,
            Verdict::Deny => PreUseDecision::Deny(format!("denied by allowlist: {}", decision.reason)),
            Verdict::Ask => PreUseDecision::Approve,
        }
    }

    fn approval_prompt(&self, args: &Value) -> String {
        let command = args.get("command").and_then(Value::as_str).unwrap_or("");
        format!("Run shell command?\n  $ {command}")
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> ToolOutput {
        let command = match args.get("command").and_then(Value::as_str) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err("missing required parameter 'command'"),
        };
        let cwd = args.get("cwd").and_then(Value::as_str).map(str::to_string);
        let timeout = args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(self.timeout_secs);

        debug!(cmd = %command, "executing shell tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        // No controlling terminal for the child: stdin from /dev/null and a
        // fresh session via setsid().  kill_on_drop ensures a timed-out
        // command is SIGKILLed when the future is dropped.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()).await;

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stdout.is_empty() {
                    content.push_str(&stdout);
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&stderr);
                }

                let code = output.status.code().unwrap_or(-1);
                if content.is_empty() {
                    content = format!("[exit {code}]");
                }
                let meta = json!({"exit_code": code});
                if output.status.success() {
                    ToolOutput::ok(content).with_metadata(meta)
                } else {
                    ToolOutput::err(format!("[exit {code}]\n{content}")).with_metadata(meta)
                }
            }
            Ok(Err(e)) => ToolOutput::err(format!("spawn error: {e}")),
            Err(_) => ToolOutput::err(format!("timeout after {timeout}s")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
