// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire vocabulary between external UIs and the kernel.
//!
//! All types are plain serde enums tagged by `type`; transports frame them
//! as JSON however they like (the kernel does not own any socket).
//!
//! # Typical observer flow
//!
//! ```text
//! UI                                    Kernel
//!  │── attach ───────────────────────────►│
//!  │◄─ init {channels, sessions, tail} ───│
//!  │── message:submit {session_id} ──────►│
//!  │◄─ event {state:changed pending} ─────│
//!  │◄─ event {message:added} ─────────────│
//!  │◄─ event {approval:requested} ────────│  (if a tool needs a human)
//!  │── tool:approve {approval_id} ───────►│
//!  │◄─ event {tool:result} ───────────────│
//!  │◄─ event {state:changed success} ─────│
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use agentd_bus::Event;
use agentd_store::{ChannelDocument, SessionSummary};

/// Requests a UI may send to the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayRequest {
    #[serde(rename = "channel:create")]
    ChannelCreate {
        name: String,
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(rename = "channel:delete")]
    ChannelDelete { name: String },
    #[serde(rename = "channel:add_agent")]
    ChannelAddAgent { channel: String, session_id: String },
    #[serde(rename = "channel:remove_agent")]
    ChannelRemoveAgent { channel: String, session_id: String },

    /// Instantiate a template directly into a channel.
    #[serde(rename = "agent:invite")]
    AgentInvite {
        channel: String,
        template: String,
        #[serde(default)]
        prompt: Option<String>,
    },
    #[serde(rename = "agent:pause")]
    AgentPause { session_id: String },
    #[serde(rename = "agent:resume")]
    AgentResume { session_id: String },
    #[serde(rename = "agent:stop")]
    AgentStop { session_id: String },

    #[serde(rename = "message:submit")]
    MessageSubmit { session_id: String, content: String },

    #[serde(rename = "tool:approve")]
    ToolApprove { approval_id: String },
    #[serde(rename = "tool:reject")]
    ToolReject { approval_id: String },
    #[serde(rename = "tool:reply")]
    ToolReply { approval_id: String, content: String },

    #[serde(rename = "pty:attach")]
    PtyAttach { pty_id: String, observer: String },
    #[serde(rename = "pty:detach")]
    PtyDetach { pty_id: String, observer: String },
    #[serde(rename = "pty:input")]
    PtyInput {
        pty_id: String,
        #[serde(default)]
        input: Option<String>,
        /// Special key name (`ENTER`, `CTRL_C`, …), translated per the key
        /// table.
        #[serde(default)]
        key: Option<String>,
    },
    #[serde(rename = "pty:close")]
    PtyClose {
        pty_id: String,
        #[serde(default)]
        force: bool,
    },

    /// Edit one message's content in a session log.
    #[serde(rename = "session:update")]
    SessionUpdate {
        session_id: String,
        index: usize,
        content: String,
    },
    /// Delete one message from a session log.
    #[serde(rename = "session:delete-event")]
    SessionDeleteEvent { session_id: String, index: usize },

    #[serde(rename = "template:list")]
    TemplateList,
    #[serde(rename = "template:get")]
    TemplateGet { name: String },
    #[serde(rename = "template:save")]
    TemplateSave { name: String, document: Value },
    #[serde(rename = "template:delete")]
    TemplateDelete { name: String },
    #[serde(rename = "template:autocomplete")]
    TemplateAutocomplete { prefix: String },
}

/// Events the kernel sends back to a UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayEvent {
    /// First frame after attach: current state plus a recent-event tail.
    #[serde(rename = "init")]
    Init {
        channels: Vec<ChannelDocument>,
        sessions: Vec<SessionSummary>,
        events: Vec<Event>,
    },
    /// A live bus event.
    #[serde(rename = "event")]
    Event { event: Event },

    #[serde(rename = "agent:invited")]
    AgentInvited { channel: String, session_id: String },
    #[serde(rename = "session:forked")]
    SessionForked {
        session_id: String,
        parent_session_id: String,
    },

    #[serde(rename = "pty:attached")]
    PtyAttached { pty_id: String, observer: String },

    #[serde(rename = "template:list:response")]
    TemplateListResponse { templates: Vec<String> },
    #[serde(rename = "template:get:response")]
    TemplateGetResponse { name: String, document: Value },
    #[serde(rename = "template:save:response")]
    TemplateSaveResponse { name: String },
    #[serde(rename = "template:delete:response")]
    TemplateDeleteResponse { name: String },
    #[serde(rename = "template:autocomplete:response")]
    TemplateAutocompleteResponse { matches: Vec<String> },

    #[serde(rename = "error")]
    Error { message: String },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
