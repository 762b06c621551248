// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    ChatCompletion, Choice, CompletionMessage, CompletionRequest, LlmProvider, Role, ToolCall,
    Usage,
};

fn completion_from(message: CompletionMessage, finish_reason: Option<String>) -> ChatCompletion {
    ChatCompletion {
        id: format!("mock-{}", uuid_like()),
        created: chrono::Utc::now().timestamp(),
        model: "mock".into(),
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason,
        }],
        usage: Usage {
            prompt_tokens: 10,
            completion_tokens: 10,
            total_tokens: 20,
        },
        metrics: None,
    }
}

/// Cheap unique suffix without pulling uuid into this crate.
fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static CTR: AtomicU64 = AtomicU64::new(0);
    format!("{:08x}", CTR.fetch_add(1, Ordering::Relaxed))
}

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as a terminating assistant turn.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_chat_completion(
        &self,
        req: CompletionRequest,
    ) -> anyhow::Result<ChatCompletion> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("[no input]");
        Ok(completion_from(
            CompletionMessage {
                role: Role::Assistant,
                content: format!("MOCK: {reply}"),
                tool_calls: None,
            },
            Some("stop".into()),
        ))
    }
}

/// One pre-scripted assistant turn for [`ScriptedProvider`].
#[derive(Debug, Clone)]
pub struct ScriptTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

impl ScriptTurn {
    /// A terminating text turn (`finish_reason = "stop"`).
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: vec![],
            finish_reason: Some("stop".into()),
        }
    }

    /// A turn requesting a single tool call.
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: id.into(),
                name: name.into(),
                arguments,
            }],
            finish_reason: Some("tool_calls".into()),
        }
    }

    /// A turn requesting several tool calls at once.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: String::new(),
            tool_calls: calls,
            finish_reason: Some("tool_calls".into()),
        }
    }
}

/// A pre-scripted provider.  Each completion call pops the next turn from
/// the front of the queue, letting tests specify exact sequences — including
/// tool calls — without network access.
pub struct ScriptedProvider {
    turns: Mutex<Vec<ScriptTurn>>,
    /// The last request seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptTurn>) -> Self {
        Self {
            turns: Mutex::new(turns),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: one tool call followed by a terminating text turn.
    pub fn tool_then_text(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ScriptTurn::tool_call(call_id, tool_name, arguments),
            ScriptTurn::text(final_text),
        ])
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create_chat_completion(
        &self,
        req: CompletionRequest,
    ) -> anyhow::Result<ChatCompletion> {
        *self.last_request.lock().unwrap() = Some(req);
        let turn = {
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                ScriptTurn::text("[no more scripts]")
            } else {
                turns.remove(0)
            }
        };
        Ok(completion_from(
            CompletionMessage {
                role: Role::Assistant,
                content: turn.content,
                tool_calls: if turn.tool_calls.is_empty() {
                    None
                } else {
                    Some(turn.tool_calls)
                },
            },
            turn.finish_reason,
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
