// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Registry tools that let agents drive PTY sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use agentd_tools::{Tool, ToolContext, ToolOutput};

use crate::manager::{CreateOptions, PtyManager};
use crate::session::ReadRequest;

pub struct PtyCreateTool {
    pub manager: Arc<PtyManager>,
}

#[async_trait]
impl Tool for PtyCreateTool {
    fn name(&self) -> &str {
        "pty_create"
    }

    fn description(&self) -> &str {
        "Open a durable pseudo-terminal session. Returns its pty_id for use \
         with pty_write / pty_read / pty_close."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Display name (optional)" },
                "cwd": { "type": "string", "description": "Working directory (optional)" },
                "shell": { "type": "string", "description": "Shell binary (optional)" },
                "initial_commands": {
                    "type": "string",
                    "description": "Command line written to the shell right after startup"
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> ToolOutput {
        let opts = CreateOptions {
            name: args.get("name").and_then(Value::as_str).map(str::to_string),
            cwd: args.get("cwd").and_then(Value::as_str).map(str::to_string),
            env: HashMap::new(),
            shell: args.get("shell").and_then(Value::as_str).map(str::to_string),
            initial_commands: args
                .get("initial_commands")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        match self.manager.create(&ctx.session_id, opts) {
            Ok(pty_id) => {
                ToolOutput::ok(format!("created PTY session {pty_id}"))
                    .with_metadata(json!({"pty_id": pty_id}))
            }
            Err(e) => ToolOutput::err(e.to_string()),
        }
    }
}

pub struct PtyWriteTool {
    pub manager: Arc<PtyManager>,
}

#[async_trait]
impl Tool for PtyWriteTool {
    fn name(&self) -> &str {
        "pty_write"
    }

    fn description(&self) -> &str {
        "Write input to a PTY session. 'input' is sent literally; 'key' \
         sends a special key (ENTER, TAB, CTRL_C, CTRL_D, CTRL_Z, ESC, UP, \
         DOWN, LEFT, RIGHT, BACKSPACE, DELETE). End commands with ENTER."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pty_id": { "type": "string", "description": "Target PTY session" },
                "input": { "type": "string", "description": "Literal text to type" },
                "key": { "type": "string", "description": "Special key name" }
            },
            "required": ["pty_id"],
            "additionalProperties": false
        })
    }

    fn requires_human_approval(&self) -> bool {
        true
    }

    fn approval_prompt(&self, args: &Value) -> String {
        let pty = args.get("pty_id").and_then(Value::as_str).unwrap_or("?");
        match args.get("input").and_then(Value::as_str) {
            Some(input) => format!("Type into PTY {pty}?\n  {input}"),
            None => format!(
                "Send key {} to PTY {pty}?",
                args.get("key").and_then(Value::as_str).unwrap_or("?")
            ),
        }
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> ToolOutput {
        let Some(pty_id) = args.get("pty_id").and_then(Value::as_str) else {
            return ToolOutput::err("missing required parameter 'pty_id'");
        };
        let result = if let Some(key) = args.get("key").and_then(Value::as_str) {
            self.manager.write_key(pty_id, key)
        } else if let Some(input) = args.get("input").and_then(Value::as_str) {
            self.manager.write(pty_id, input.as_bytes())
        } else {
            return ToolOutput::err("provide 'input' or 'key'");
        };
        match result {
            Ok(()) => ToolOutput::ok("written"),
            Err(e) => ToolOutput::err(e.to_string()),
        }
    }
}

pub struct PtyReadTool {
    pub manager: Arc<PtyManager>,
}

#[async_trait]
impl Tool for PtyReadTool {
    fn name(&self) -> &str {
        "pty_read"
    }

    fn description(&self) -> &str {
        "Read a PTY session's scrollback: either the last N lines or only \
         what is new since this agent's previous read."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pty_id": { "type": "string", "description": "Target PTY session" },
                "lines": { "type": "integer", "description": "Last N lines (default 100)" },
                "since_last_read": {
                    "type": "boolean",
                    "description": "Only content after the previous read"
                }
            },
            "required": ["pty_id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> ToolOutput {
        let Some(pty_id) = args.get("pty_id").and_then(Value::as_str) else {
            return ToolOutput::err("missing required parameter 'pty_id'");
        };
        let req = ReadRequest {
            lines: args.get("lines").and_then(Value::as_u64).map(|n| n as usize),
            since_last_read: args
                .get("since_last_read")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            subscriber: Some(format!("agent:{}", ctx.session_id)),
        };
        match self.manager.read(pty_id, &req) {
            Ok(result) => ToolOutput::ok(result.content).with_metadata(json!({
                "lines_read": result.lines_read,
                "total_lines": result.total_lines,
                "last_read_line": result.last_read_line,
            })),
            Err(e) => ToolOutput::err(e.to_string()),
        }
    }
}

pub struct PtyCloseTool {
    pub manager: Arc<PtyManager>,
}

#[async_trait]
impl Tool for PtyCloseTool {
    fn name(&self) -> &str {
        "pty_close"
    }

    fn description(&self) -> &str {
        "Close a PTY session. 'force' escalates to SIGKILL after a short \
         grace period."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pty_id": { "type": "string", "description": "Target PTY session" },
                "force": { "type": "boolean", "description": "SIGKILL after grace (default true)" }
            },
            "required": ["pty_id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> ToolOutput {
        let Some(pty_id) = args.get("pty_id").and_then(Value::as_str) else {
            return ToolOutput::err("missing required parameter 'pty_id'");
        };
        let force = args.get("force").and_then(Value::as_bool).unwrap_or(true);
        match self.manager.close(pty_id, force).await {
            Ok(()) => ToolOutput::ok(format!("closed PTY session {pty_id}")),
            Err(e) => ToolOutput::err(e.to_string()),
        }
    }
}

/// Register the four PTY tools against one manager.
pub fn register_pty_tools(
    registry: &mut agentd_tools::ToolRegistry,
    manager: &Arc<PtyManager>,
) {
    registry.register(PtyCreateTool {
        manager: Arc::clone(manager),
    });
    registry.register(PtyWriteTool {
        manager: Arc::clone(manager),
    });
    registry.register(PtyReadTool {
        manager: Arc::clone(manager),
    });
    registry.register(PtyCloseTool {
        manager: Arc::clone(manager),
    });
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
