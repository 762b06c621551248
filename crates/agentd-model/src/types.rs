// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A structured tool invocation embedded in an assistant message.
///
/// `arguments` is kept as a parsed JSON value; providers that ship arguments
/// as a string are normalized by their adapter before reaching the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One message in a session log, persisted verbatim.
///
/// `ts` and `finish_reason` exist only on disk and in the observability
/// stream; they are stripped before the message is shipped to a provider
/// (see [`Message::to_wire`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub ts: DateTime<Utc>,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Only on `assistant` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Only on `tool` messages; matches the id of an earlier assistant call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Assistant turn carrying tool calls (content may be empty).
    pub fn assistant_with_calls(
        text: impl Into<String>,
        calls: Vec<ToolCall>,
        finish_reason: Option<String>,
    ) -> Self {
        Self {
            tool_calls: if calls.is_empty() { None } else { Some(calls) },
            finish_reason,
            ..Self::new(Role::Assistant, text)
        }
    }

    /// Result of executing a tool call.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            role,
            content: text.into(),
            tool_calls: None,
            tool_call_id: None,
            finish_reason: None,
        }
    }

    /// Pending tool calls: calls on this message without a matching `tool`
    /// message later in `log`.
    pub fn unresolved_calls<'a>(&'a self, log: &[Message]) -> Vec<&'a ToolCall> {
        let Some(calls) = &self.tool_calls else {
            return Vec::new();
        };
        calls
            .iter()
            .filter(|c| {
                !log.iter()
                    .any(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(&c.id))
            })
            .collect()
    }

    /// Provider wire form: only `{role, content, tool_calls?, tool_call_id?}`.
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
        }
    }
}

/// Message as shipped to a provider — timestamps and finish reasons dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Build the outbound message list for one completion: an optional system
/// prompt followed by the filtered session log.
pub fn to_wire_messages(system_prompt: Option<&str>, log: &[Message]) -> Vec<WireMessage> {
    let mut out = Vec::with_capacity(log.len() + 1);
    if let Some(sp) = system_prompt {
        out.push(WireMessage {
            role: Role::System,
            content: sp.to_string(),
            tool_calls: None,
            tool_call_id: None,
        });
    }
    out.extend(log.iter().map(Message::to_wire));
    out
}

// ─── Completion request / response ────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Normalized provider response.  Adapters are responsible for producing
/// this shape; the engine reads only the first choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

impl ChatCompletion {
    /// The first choice, which is the only one the engine consumes.
    pub fn first(&self) -> Option<&Choice> {
        self.choices.first()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: CompletionMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// The assistant message inside a completion choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
