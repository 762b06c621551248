// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use agentd_model::Message;

pub const API_VERSION: &str = "daemon/v1";
pub const KIND_AGENT: &str = "Agent";

/// One persisted session (or template — templates share the schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: SessionMetadata,
    pub spec: SessionSpec,
}

impl SessionDocument {
    /// `true` when apiVersion and kind carry the expected values.
    pub fn is_valid_agent(&self) -> bool {
        self.api_version == API_VERSION && self.kind == KIND_AGENT
    }

    /// Preview of the last message for session listings (first 80 chars of
    /// its content, newlines collapsed).
    pub fn last_message_preview(&self) -> Option<String> {
        let m = self.spec.messages.last()?;
        let flat = m.content.replace('\n', " ");
        let preview: String = flat.chars().take(80).collect();
        Some(preview)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Agent template name this session was instantiated from.
    pub name: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Tool capability list: names this session may invoke.  `None` means
    /// every registered tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    /// PID of an attached interactive CLI, when one owns the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Wall-clock timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Last-read cursor used by external log viewers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read: Option<DateTime<Utc>>,
    /// FSM projection for crash recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsm_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsm_state_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Lightweight listing entry for `list()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: String,
    pub name: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

/// Render operating-system facts into a system-prompt template.
///
/// Supported variables: `{{os}}`, `{{arch}}`, `{{shell}}`, `{{hostname}}`.
pub fn render_system_prompt(template: &str) -> String {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    template
        .replace("{{os}}", std::env::consts::OS)
        .replace("{{arch}}", std::env::consts::ARCH)
        .replace("{{shell}}", &shell)
        .replace("{{hostname}}", &host)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
