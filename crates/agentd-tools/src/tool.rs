// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// Decision returned by a tool's pre-use policy hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreUseDecision {
    /// Execute immediately.
    Allow,
    /// Enqueue a human-approval request and suspend the call.
    Approve,
    /// Refuse; the reason becomes the failed tool result.
    Deny(String),
}

/// Execution context handed to hooks and to `execute`.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_id: String,
    /// `true` when a human already granted this specific call; the
    /// dispatcher sets it when re-dispatching after an approval so the
    /// pre-use hook is not consulted twice.
    pub approval_grant: bool,
}

impl ToolContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            approval_grant: false,
        }
    }
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub content: String,
    pub metadata: Value,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            metadata: Value::Null,
        }
    }

    pub fn err(content: impl Into<String>) -> Self {
        Self {
            success: false,
            content: content.into(),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Trait every built-in and MCP-translated tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Whether calls require a human decision when no other policy applies.
    fn requires_human_approval(&self) -> bool {
        false
    }

    /// Pre-use policy hook consulted by the dispatcher before execution.
    ///
    /// The default derives from [`Tool::requires_human_approval`]; tools
    /// with real policies (the shell's allowlist, MCP server policy)
    /// override it.
    fn pre_use(&self, _args: &Value, _ctx: &ToolContext) -> PreUseDecision {
        if self.requires_human_approval() {
            PreUseDecision::Approve
        } else {
            PreUseDecision::Allow
        }
    }

    /// Text shown to the operator when this call awaits approval.
    fn approval_prompt(&self, args: &Value) -> String {
        let rendered = args.to_string();
        let shortened: String = rendered.chars().take(120).collect();
        if shortened.len() < rendered.len() {
            format!("{}({}…)", self.name(), shortened)
        } else {
            format!("{}({})", self.name(), shortened)
        }
    }

    /// Execute the tool.  Failures are reported through
    /// [`ToolOutput::err`], never by panicking.
    async fn execute(&self, args: &Value, ctx: &ToolContext) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
