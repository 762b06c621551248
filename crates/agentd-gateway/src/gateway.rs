// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Request handling for external UIs.
//!
//! The gateway is a thin projection over the kernel: it maps decoded
//! [`GatewayRequest`]s onto store/engine/PTY operations and hands each
//! observer the bus stream plus an init frame.  Failures never escape as
//! errors — they become `error` events for the requesting UI.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use agentd_bus::{Event, EventKind};
use agentd_engine::{EngineHandle, KernelContext};
use agentd_store::SessionDocument;

use crate::protocol::{GatewayEvent, GatewayRequest};

pub struct Gateway {
    ctx: KernelContext,
    engine: EngineHandle,
}

impl Gateway {
    pub fn new(ctx: KernelContext, engine: EngineHandle) -> Self {
        Self { ctx, engine }
    }

    /// The first frame a newly attached observer receives: current
    /// channels, session summaries, and a tail of recent events.
    pub fn init_frame(&self) -> GatewayEvent {
        GatewayEvent::Init {
            channels: self.ctx.channels.list().unwrap_or_default(),
            sessions: self.ctx.store.list().unwrap_or_default(),
            events: self.ctx.bus.recent(),
        }
    }

    /// Live bus events for an observer; map each to
    /// [`GatewayEvent::Event`] when framing.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.ctx.bus.subscribe()
    }

    /// Handle one request, returning the events addressed to the
    /// requesting UI.  Broadcast effects travel through the bus.
    pub async fn handle(&self, request: GatewayRequest) -> Vec<GatewayEvent> {
        debug!(?request, "gateway request");
        match self.dispatch(request).await {
            Ok(events) => events,
            Err(message) => {
                warn!(%message, "gateway request failed");
                vec![GatewayEvent::Error { message }]
            }
        }
    }

    async fn dispatch(&self, request: GatewayRequest) -> Result<Vec<GatewayEvent>, String> {
        match request {
            // ── Channels ──────────────────────────────────────────────────────
            GatewayRequest::ChannelCreate { name, description } => {
                self.ctx
                    .channels
                    .create(&name, description.as_deref())
                    .map_err(|e| e.to_string())?;
                self.ctx.bus.publish(
                    EventKind::ChannelCreated,
                    None,
                    Some(&name),
                    json!({"name": name}),
                );
                Ok(vec![])
            }
            GatewayRequest::ChannelDelete { name } => {
                self.ctx.channels.delete(&name).map_err(|e| e.to_string())?;
                self.ctx.bus.publish(
                    EventKind::ChannelDeleted,
                    None,
                    Some(&name),
                    json!({"name": name}),
                );
                Ok(vec![])
            }
            GatewayRequest::ChannelAddAgent {
                channel,
                session_id,
            } => {
                self.ctx
                    .channels
                    .add_session(&channel, &session_id)
                    .map_err(|e| e.to_string())?;
                self.ctx.bus.publish(
                    EventKind::ChannelJoined,
                    Some(&session_id),
                    Some(&channel),
                    json!({"channel": channel}),
                );
                Ok(vec![])
            }
            GatewayRequest::ChannelRemoveAgent {
                channel,
                session_id,
            } => {
                self.ctx
                    .channels
                    .remove_session(&channel, &session_id)
                    .map_err(|e| e.to_string())?;
                self.ctx.bus.publish(
                    EventKind::ChannelLeft,
                    Some(&session_id),
                    Some(&channel),
                    json!({"channel": channel}),
                );
                Ok(vec![])
            }

            // ── Agents ────────────────────────────────────────────────────────
            GatewayRequest::AgentInvite {
                channel,
                template,
                prompt,
            } => {
                let session_id = self
                    .ctx
                    .store
                    .new_session(&template, prompt.as_deref())
                    .await
                    .map_err(|e| e.to_string())?;
                self.ctx
                    .channels
                    .add_session(&channel, &session_id)
                    .map_err(|e| e.to_string())?;
                self.engine.register(&session_id);
                self.ctx.bus.publish(
                    EventKind::ChannelJoined,
                    Some(&session_id),
                    Some(&channel),
                    json!({"channel": channel, "template": template}),
                );
                Ok(vec![GatewayEvent::AgentInvited {
                    channel,
                    session_id,
                }])
            }
            GatewayRequest::AgentPause { session_id } => {
                self.engine.pause(&session_id);
                Ok(vec![])
            }
            GatewayRequest::AgentResume { session_id } => {
                self.engine.resume(&session_id);
                Ok(vec![])
            }
            GatewayRequest::AgentStop { session_id } => {
                self.engine.stop(&session_id);
                Ok(vec![])
            }

            // ── Messages ──────────────────────────────────────────────────────
            GatewayRequest::MessageSubmit {
                session_id,
                content,
            } => {
                self.ctx
                    .store
                    .push(&session_id, &content)
                    .await
                    .map_err(|e| e.to_string())?;
                self.ctx.bus.publish(
                    EventKind::MessageAdded,
                    Some(&session_id),
                    None,
                    json!({"role": "user", "content": content}),
                );
                self.engine.register(&session_id);
                Ok(vec![])
            }

            // ── Approvals ─────────────────────────────────────────────────────
            GatewayRequest::ToolApprove { approval_id } => {
                self.engine.resolve_approval(&approval_id, true, None);
                Ok(vec![])
            }
            GatewayRequest::ToolReject { approval_id } => {
                self.engine.resolve_approval(&approval_id, false, None);
                Ok(vec![])
            }
            GatewayRequest::ToolReply {
                approval_id,
                content,
            } => {
                self.engine.resolve_approval(&approval_id, true, Some(content));
                Ok(vec![])
            }

            // ── PTY ───────────────────────────────────────────────────────────
            GatewayRequest::PtyAttach { pty_id, observer } => {
                self.ctx
                    .pty
                    .attach(&pty_id, &observer)
                    .map_err(|e| e.to_string())?;
                Ok(vec![GatewayEvent::PtyAttached { pty_id, observer }])
            }
            GatewayRequest::PtyDetach { pty_id, observer } => {
                self.ctx
                    .pty
                    .detach(&pty_id, &observer)
                    .map_err(|e| e.to_string())?;
                Ok(vec![])
            }
            GatewayRequest::PtyInput { pty_id, input, key } => {
                match (input, key) {
                    (_, Some(key)) => self
                        .ctx
                        .pty
                        .write_key(&pty_id, &key)
                        .map_err(|e| e.to_string())?,
                    (Some(text), None) => self
                        .ctx
                        .pty
                        .write(&pty_id, text.as_bytes())
                        .map_err(|e| e.to_string())?,
                    (None, None) => return Err("pty:input requires 'input' or 'key'".into()),
                }
                Ok(vec![])
            }
            GatewayRequest::PtyClose { pty_id, force } => {
                self.ctx
                    .pty
                    .close(&pty_id, force)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(vec![])
            }

            // ── Log edits ─────────────────────────────────────────────────────
            GatewayRequest::SessionUpdate {
                session_id,
                index,
                content,
            } => {
                self.ctx
                    .store
                    .edit_message(&session_id, index, &content)
                    .await
                    .map_err(|e| e.to_string())?;
                self.ctx.bus.publish(
                    EventKind::SessionUpdated,
                    Some(&session_id),
                    None,
                    json!({"index": index}),
                );
                Ok(vec![])
            }
            GatewayRequest::SessionDeleteEvent { session_id, index } => {
                self.ctx
                    .store
                    .delete_message(&session_id, index)
                    .await
                    .map_err(|e| e.to_string())?;
                self.ctx.bus.publish(
                    EventKind::SessionUpdated,
                    Some(&session_id),
                    None,
                    json!({"deleted_index": index}),
                );
                Ok(vec![])
            }

            // ── Templates ─────────────────────────────────────────────────────
            GatewayRequest::TemplateList => Ok(vec![GatewayEvent::TemplateListResponse {
                templates: self.ctx.store.list_templates().map_err(|e| e.to_string())?,
            }]),
            GatewayRequest::TemplateGet { name } => {
                let doc = self
                    .ctx
                    .store
                    .load_template(&name)
                    .map_err(|e| e.to_string())?;
                let document = serde_json::to_value(&doc).map_err(|e| e.to_string())?;
                Ok(vec![GatewayEvent::TemplateGetResponse { name, document }])
            }
            GatewayRequest::TemplateSave { name, document } => {
                let doc: SessionDocument =
                    serde_json::from_value(document).map_err(|e| e.to_string())?;
                if !doc.is_valid_agent() {
                    return Err("template must be a daemon/v1 Agent document".into());
                }
                self.ctx
                    .store
                    .save_template(&name, &doc)
                    .map_err(|e| e.to_string())?;
                Ok(vec![GatewayEvent::TemplateSaveResponse { name }])
            }
            GatewayRequest::TemplateDelete { name } => {
                self.ctx
                    .store
                    .delete_template(&name)
                    .map_err(|e| e.to_string())?;
                Ok(vec![GatewayEvent::TemplateDeleteResponse { name }])
            }
            GatewayRequest::TemplateAutocomplete { prefix } => {
                let matches = self
                    .ctx
                    .store
                    .list_templates()
                    .map_err(|e| e.to_string())?
                    .into_iter()
                    .filter(|t| t.starts_with(&prefix))
                    .collect();
                Ok(vec![GatewayEvent::TemplateAutocompleteResponse { matches }])
            }
        }
    }

    /// Fork an existing session; used by the CLI's `fork` subcommand and
    /// exposed here so UIs can share the code path.
    pub async fn fork_session(
        &self,
        session_id: &str,
        prompt: Option<&str>,
    ) -> Result<String, String> {
        let new_id = self
            .ctx
            .store
            .fork(session_id, prompt)
            .await
            .map_err(|e| e.to_string())?;
        self.ctx.bus.publish(
            EventKind::SessionForked,
            Some(&new_id),
            None,
            json!({"parent_session_id": session_id}),
        );
        self.engine.register(&new_id);
        Ok(new_id)
    }

    pub fn context(&self) -> &KernelContext {
        &self.ctx
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }
}

// Arc convenience: transports hold `Arc<Gateway>`.
impl Gateway {
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
