// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The session orchestration engine.
//!
//! A single cooperative scheduler ticks every ~100 ms and drives every
//! registered session according to its FSM state.  Long work — model calls
//! and tool execution — runs in per-session tasks whose results arrive on
//! oneshot channels the scheduler polls non-blockingly, so one session's
//! I/O never stalls another's.  A session has at most one in-flight turn.
//!
//! External operations (pause / resume / stop / retry / approval
//! resolutions) post commands that the engine applies at tick boundaries.
//! Stop never aborts in-flight I/O: the turn's result is discarded when it
//! arrives for a session that is no longer driving.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use agentd_bus::EventKind;
use agentd_model::{to_wire_messages, ChatCompletion, CompletionRequest, Message, ToolCall};

use crate::approvals::ApprovalRequest;
use crate::context::KernelContext;
use crate::dispatcher::{dispatch, DispatchOutcome};
use crate::fsm::{check_transition, SessionState, TransitionMode};

/// Commands applied by the engine at tick boundaries.
#[derive(Debug)]
pub enum EngineCommand {
    /// Begin driving a persisted session.
    Register { session_id: String },
    Pause { session_id: String },
    Resume { session_id: String },
    Stop { session_id: String },
    /// `failed → pending` re-entry.
    Retry { session_id: String },
    ResolveApproval {
        approval_id: String,
        approved: bool,
        reply: Option<String>,
    },
    Shutdown,
}

/// Cheap clone-able handle for posting commands to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub fn register(&self, session_id: &str) {
        let _ = self.tx.send(EngineCommand::Register {
            session_id: session_id.to_string(),
        });
    }

    pub fn pause(&self, session_id: &str) {
        let _ = self.tx.send(EngineCommand::Pause {
            session_id: session_id.to_string(),
        });
    }

    pub fn resume(&self, session_id: &str) {
        let _ = self.tx.send(EngineCommand::Resume {
            session_id: session_id.to_string(),
        });
    }

    pub fn stop(&self, session_id: &str) {
        let _ = self.tx.send(EngineCommand::Stop {
            session_id: session_id.to_string(),
        });
    }

    pub fn retry(&self, session_id: &str) {
        let _ = self.tx.send(EngineCommand::Retry {
            session_id: session_id.to_string(),
        });
    }

    pub fn resolve_approval(&self, approval_id: &str, approved: bool, reply: Option<String>) {
        let _ = self.tx.send(EngineCommand::ResolveApproval {
            approval_id: approval_id.to_string(),
            approved,
            reply,
        });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(EngineCommand::Shutdown);
    }
}

enum TurnOutcome {
    Completed(Box<ChatCompletion>),
    Failed(String),
}

/// Per-session scheduler bookkeeping.  The persisted document remains the
/// source of truth for the message log; this struct only tracks what the
/// scheduler needs between ticks.
struct ActiveSession {
    state: SessionState,
    turn: Option<oneshot::Receiver<TurnOutcome>>,
    tool: Option<oneshot::Receiver<DispatchOutcome>>,
    /// Call ids a human approved; the next dispatch skips the gate.
    granted: HashSet<String>,
    /// Call ids resolved without execution: denial or operator reply.
    /// Value is `(success, content)` for the synthesized `tool` message.
    synth: HashMap<String, (bool, String)>,
    /// Approval id the session is parked on in `human_input`.
    pending_approval: Option<String>,
    deadline: Option<Instant>,
}

impl ActiveSession {
    fn new(state: SessionState, deadline: Option<Instant>) -> Self {
        Self {
            state,
            turn: None,
            tool: None,
            granted: HashSet::new(),
            synth: HashMap::new(),
            pending_approval: None,
            deadline,
        }
    }

    fn idle(&self) -> bool {
        self.turn.is_none() && self.tool.is_none()
    }
}

pub struct Engine {
    ctx: KernelContext,
    mode: TransitionMode,
    tick: Duration,
    sessions: HashMap<String, ActiveSession>,
    rx: mpsc::UnboundedReceiver<EngineCommand>,
}

impl Engine {
    pub fn new(ctx: KernelContext, mode: TransitionMode) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tick = Duration::from_millis(ctx.config.engine.tick_ms.max(1));
        (
            Self {
                ctx,
                mode,
                tick,
                sessions: HashMap::new(),
                rx,
            },
            EngineHandle { tx },
        )
    }

    /// Startup crash recovery: re-register every persisted session.  A
    /// session whose log ends in a user message but whose state is
    /// `created` or `success` is promoted to `pending` so the daemon picks
    /// it up where it left off.
    pub async fn recover(&mut self) -> anyhow::Result<()> {
        for id in self.ctx.store.session_ids()? {
            let doc = match self.ctx.store.load(&id) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(session = %id, error = %e, "skipping unrecoverable session");
                    continue;
                }
            };
            let mut state = doc
                .metadata
                .fsm_state
                .as_deref()
                .and_then(SessionState::parse)
                .unwrap_or(SessionState::Created);

            let ends_in_user = doc
                .spec
                .messages
                .last()
                .is_some_and(|m| m.role == agentd_model::Role::User);
            if ends_in_user
                && matches!(state, SessionState::Created | SessionState::Success)
            {
                state = SessionState::Pending;
                self.ctx
                    .store
                    .set_fsm_state(&id, state.as_str(), None)
                    .await?;
                info!(session = %id, "promoted to pending during recovery");
            }

            if !state.is_terminal() {
                let deadline = self.deadline_for(&doc);
                self.sessions
                    .insert(id.clone(), ActiveSession::new(state, deadline));
                debug!(session = %id, %state, "session registered from disk");
            }
        }
        Ok(())
    }

    fn deadline_for(&self, doc: &agentd_store::SessionDocument) -> Option<Instant> {
        doc.metadata
            .timeout
            .or(self.ctx.config.engine.session_timeout_secs)
            .map(|secs| Instant::now() + Duration::from_secs(secs))
    }

    /// Run the scheduler until a `Shutdown` command arrives.
    pub async fn run(mut self) {
        info!(tick_ms = self.tick.as_millis() as u64, "fsm engine started");
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.drain_commands().await {
                break;
            }
            self.expire_approvals();
            self.check_timeouts();
            let ids: Vec<String> = self.sessions.keys().cloned().collect();
            for id in ids {
                self.drive(&id).await;
            }
        }
        info!("fsm engine stopped");
    }

    // ── Command handling ──────────────────────────────────────────────────────

    /// Returns `false` when a shutdown was requested.
    async fn drain_commands(&mut self) -> bool {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                EngineCommand::Shutdown => return false,
                EngineCommand::Register { session_id } => self.handle_register(&session_id),
                EngineCommand::Pause { session_id } => {
                    self.transition(&session_id, SessionState::Paused, None);
                }
                EngineCommand::Resume { session_id } => {
                    self.transition(&session_id, SessionState::Pending, None);
                }
                EngineCommand::Stop { session_id } => self.handle_stop(&session_id),
                EngineCommand::Retry { session_id } => {
                    self.transition(&session_id, SessionState::Pending, None);
                }
                EngineCommand::ResolveApproval {
                    approval_id,
                    approved,
                    reply,
                } => self.handle_resolution(&approval_id, approved, reply),
            }
        }
        true
    }

    fn handle_register(&mut self, id: &str) {
        let doc = match self.ctx.store.load(id) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(session = %id, error = %e, "register: cannot load session");
                return;
            }
        };
        let doc_state = doc
            .metadata
            .fsm_state
            .as_deref()
            .and_then(SessionState::parse)
            .unwrap_or(SessionState::Created);
        let deadline = self.deadline_for(&doc);

        match self.sessions.get_mut(id) {
            None => {
                self.sessions
                    .insert(id.to_string(), ActiveSession::new(doc_state, deadline));
                debug!(session = %id, state = %doc_state, "session registered");
            }
            Some(active) if active.idle() => {
                // A push may have promoted the document (e.g. a completed
                // session got a new user message); follow it.
                active.state = doc_state;
                active.deadline = deadline;
            }
            Some(_) => {}
        }
    }

    fn handle_stop(&mut self, id: &str) {
        if self.transition(id, SessionState::Stopped, None) {
            let pty = Arc::clone(&self.ctx.pty);
            let owner = id.to_string();
            tokio::spawn(async move { pty.close_for_owner(&owner).await });
        }
    }

    fn handle_resolution(&mut self, approval_id: &str, approved: bool, reply: Option<String>) {
        let Some(res) = self.ctx.approvals.resolve(approval_id, approved, reply) else {
            warn!(approval = %approval_id, "resolution for unknown approval request");
            return;
        };
        let session_id = res.request.session_id.clone();
        let call_id = res.request.tool_call.id.clone();

        if let Some(active) = self.sessions.get_mut(&session_id) {
            if let Some(reply) = res.reply {
                // An operator reply becomes the tool result verbatim.
                active.synth.insert(call_id.clone(), (true, reply));
            } else if res.approved {
                active.granted.insert(call_id.clone());
            } else {
                active.synth
                    .insert(call_id.clone(), (false, "denied by user".to_string()));
            }
        }

        let kind = if res.approved {
            EventKind::ApprovalResolved
        } else {
            EventKind::ApprovalDenied
        };
        self.ctx.bus.publish(
            kind,
            Some(&session_id),
            None,
            json!({"approval_id": approval_id, "tool_call_id": call_id, "approved": res.approved}),
        );

        let parked = self
            .sessions
            .get(&session_id)
            .is_some_and(|a| {
                a.state == SessionState::HumanInput
                    && a.pending_approval.as_deref() == Some(approval_id)
            });
        if parked {
            if let Some(active) = self.sessions.get_mut(&session_id) {
                active.pending_approval = None;
            }
            self.transition(&session_id, SessionState::Running, None);
        }
    }

    // ── Tick work ─────────────────────────────────────────────────────────────

    fn expire_approvals(&mut self) {
        for request in self.ctx.approvals.expire_due(Instant::now()) {
            warn!(approval = %request.id, session = %request.session_id, "approval expired");
            self.ctx.bus.publish(
                EventKind::ApprovalDenied,
                Some(&request.session_id),
                None,
                json!({"approval_id": request.id, "tool_call_id": request.tool_call.id, "reason": "timeout"}),
            );
            let parked = self
                .sessions
                .get(&request.session_id)
                .is_some_and(|a| {
                    a.state == SessionState::HumanInput
                        && a.pending_approval.as_deref() == Some(request.id.as_str())
                });
            if let Some(active) = self.sessions.get_mut(&request.session_id) {
                active
                    .synth
                    .insert(request.tool_call.id.clone(), (false, "denied (timeout)".to_string()));
            }
            if parked {
                if let Some(active) = self.sessions.get_mut(&request.session_id) {
                    active.pending_approval = None;
                }
                self.transition(&request.session_id, SessionState::Running, None);
            }
        }
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let overdue: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, a)| {
                !a.state.is_terminal() && a.deadline.is_some_and(|d| d <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in overdue {
            warn!(session = %id, "session wall-clock timeout");
            self.transition(
                &id,
                SessionState::Failed,
                Some(json!({"error": "session timeout"})),
            );
        }
    }

    async fn drive(&mut self, id: &str) {
        let Some(state) = self.sessions.get(id).map(|a| a.state) else {
            return;
        };
        match state {
            SessionState::Created
            | SessionState::HumanInput
            | SessionState::Paused
            | SessionState::Success
            | SessionState::Failed
            | SessionState::Stopped => {}
            SessionState::Pending => {
                if self.transition(id, SessionState::Running, None) {
                    self.ctx
                        .bus
                        .publish(EventKind::SessionStarted, Some(id), None, Value::Null);
                    self.spawn_turn(id);
                }
            }
            SessionState::Running => {
                let in_flight = self
                    .sessions
                    .get(id)
                    .is_some_and(|a| a.turn.is_some());
                if in_flight {
                    self.poll_turn(id).await;
                } else if self.next_unresolved_call(id).is_some() {
                    self.transition(id, SessionState::ToolExec, None);
                } else {
                    self.spawn_turn(id);
                }
            }
            SessionState::ToolExec => {
                let in_flight = self
                    .sessions
                    .get(id)
                    .is_some_and(|a| a.tool.is_some());
                if in_flight {
                    self.poll_tool(id).await;
                    return;
                }
                match self.next_unresolved_call(id) {
                    None => {
                        self.transition(id, SessionState::Running, None);
                    }
                    Some(call) => {
                        let synthesized = self
                            .sessions
                            .get_mut(id)
                            .and_then(|a| a.synth.remove(&call.id));
                        if let Some((success, content)) = synthesized {
                            self.append_tool_message(id, &call, success, content).await;
                        } else {
                            self.spawn_dispatch(id, call);
                        }
                    }
                }
            }
        }
    }

    // ── Model turns ───────────────────────────────────────────────────────────

    fn spawn_turn(&mut self, id: &str) {
        let Some(active) = self.sessions.get_mut(id) else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        active.turn = Some(rx);

        let ctx = self.ctx.clone();
        let session_id = id.to_string();
        tokio::spawn(async move {
            let outcome = run_turn(&ctx, &session_id).await;
            let _ = tx.send(outcome);
        });
    }

    async fn poll_turn(&mut self, id: &str) {
        let Some(mut rx) = self.sessions.get_mut(id).and_then(|a| a.turn.take()) else {
            return;
        };
        match rx.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => {
                if let Some(active) = self.sessions.get_mut(id) {
                    active.turn = Some(rx);
                }
            }
            Err(oneshot::error::TryRecvError::Closed) => {
                self.transition(
                    id,
                    SessionState::Failed,
                    Some(json!({"error": "turn task dropped"})),
                );
            }
            Ok(TurnOutcome::Failed(error)) => {
                warn!(session = %id, %error, "model turn failed");
                self.transition(id, SessionState::Failed, Some(json!({"error": error})));
            }
            Ok(TurnOutcome::Completed(completion)) => {
                self.handle_completion(id, *completion).await;
            }
        }
    }

    async fn handle_completion(&mut self, id: &str, completion: ChatCompletion) {
        let Some(choice) = completion.choices.into_iter().next() else {
            self.transition(
                id,
                SessionState::Failed,
                Some(json!({"error": "provider returned no choices"})),
            );
            return;
        };
        let calls = choice.message.tool_calls.clone().unwrap_or_default();
        let message = Message::assistant_with_calls(
            choice.message.content,
            calls.clone(),
            choice.finish_reason.clone(),
        );

        if let Err(e) = self.ctx.store.append_message(id, message.clone()).await {
            self.transition(id, SessionState::Failed, Some(json!({"error": e.to_string()})));
            return;
        }
        self.ctx.bus.publish(
            EventKind::MessageAdded,
            Some(id),
            None,
            serde_json::to_value(&message).unwrap_or(Value::Null),
        );

        if !calls.is_empty() {
            self.transition(id, SessionState::ToolExec, None);
        } else if choice.finish_reason.as_deref() == Some("stop") {
            if self.transition(id, SessionState::Success, None) {
                self.finish_session(id);
            }
        } else {
            // Any other finish reason yields the scheduler and re-queues the
            // session for another turn.
            self.transition(id, SessionState::Pending, None);
        }
    }

    fn finish_session(&mut self, id: &str) {
        let pty = Arc::clone(&self.ctx.pty);
        let owner = id.to_string();
        tokio::spawn(async move { pty.close_for_owner(&owner).await });
    }

    // ── Tool execution ────────────────────────────────────────────────────────

    /// The next pending tool call, in first-in order, from the latest
    /// assistant message carrying calls.
    fn next_unresolved_call(&self, id: &str) -> Option<ToolCall> {
        let doc = self.ctx.store.load(id).ok()?;
        let log = &doc.spec.messages;
        let assistant = log
            .iter()
            .rev()
            .find(|m| m.tool_calls.as_ref().is_some_and(|c| !c.is_empty()))?;
        assistant
            .unresolved_calls(log)
            .first()
            .map(|c| (*c).clone())
    }

    fn spawn_dispatch(&mut self, id: &str, call: ToolCall) {
        let Some(active) = self.sessions.get_mut(id) else {
            return;
        };
        let granted = active.granted.contains(&call.id);
        let (tx, rx) = oneshot::channel();
        active.tool = Some(rx);

        self.ctx.bus.publish(
            EventKind::ToolCall,
            Some(id),
            None,
            json!({"id": call.id, "name": call.name, "arguments": call.arguments}),
        );

        let ctx = self.ctx.clone();
        let session_id = id.to_string();
        tokio::spawn(async move {
            let outcome = dispatch(&ctx, &session_id, &call, granted).await;
            let _ = tx.send(outcome);
        });
    }

    async fn poll_tool(&mut self, id: &str) {
        let Some(mut rx) = self.sessions.get_mut(id).and_then(|a| a.tool.take()) else {
            return;
        };
        match rx.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => {
                if let Some(active) = self.sessions.get_mut(id) {
                    active.tool = Some(rx);
                }
            }
            Err(oneshot::error::TryRecvError::Closed) => {
                self.transition(
                    id,
                    SessionState::Failed,
                    Some(json!({"error": "tool task dropped"})),
                );
            }
            Ok(DispatchOutcome::Executed {
                message,
                tool_name,
                success,
                policy_denied,
            }) => {
                let call_id = message.tool_call_id.clone().unwrap_or_default();
                if let Some(active) = self.sessions.get_mut(id) {
                    active.granted.remove(&call_id);
                }
                if let Err(e) = self.ctx.store.append_message(id, message).await {
                    self.transition(
                        id,
                        SessionState::Failed,
                        Some(json!({"error": e.to_string()})),
                    );
                    return;
                }
                if policy_denied {
                    self.ctx.bus.publish(
                        EventKind::ApprovalDenied,
                        Some(id),
                        None,
                        json!({"tool_call_id": call_id, "tool": tool_name, "reason": "policy"}),
                    );
                }
                self.ctx.bus.publish(
                    EventKind::ToolResult,
                    Some(id),
                    None,
                    json!({"tool_call_id": call_id, "tool": tool_name, "success": success}),
                );
            }
            Ok(DispatchOutcome::NeedsApproval(request)) => {
                self.park_for_approval(id, request);
            }
        }
    }

    fn park_for_approval(&mut self, id: &str, request: ApprovalRequest) {
        let deadline = self
            .ctx
            .config
            .engine
            .approval_timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let approval_id = request.id.clone();
        self.ctx.bus.publish(
            EventKind::ApprovalRequested,
            Some(id),
            None,
            json!({
                "approval_id": approval_id,
                "tool_call_id": request.tool_call.id,
                "tool": request.tool_call.name,
                "prompt": request.prompt,
            }),
        );
        self.ctx.approvals.enqueue(request, deadline);
        if let Some(active) = self.sessions.get_mut(id) {
            active.pending_approval = Some(approval_id.clone());
        }
        self.transition(
            id,
            SessionState::HumanInput,
            Some(json!({"approval_id": approval_id})),
        );
    }

    async fn append_tool_message(
        &mut self,
        id: &str,
        call: &ToolCall,
        success: bool,
        content: String,
    ) {
        let message = Message::tool_result(&call.id, content);
        if let Err(e) = self.ctx.store.append_message(id, message).await {
            self.transition(
                id,
                SessionState::Failed,
                Some(json!({"error": e.to_string()})),
            );
            return;
        }
        self.ctx.bus.publish(
            EventKind::ToolResult,
            Some(id),
            None,
            json!({"tool_call_id": call.id, "tool": call.name, "success": success}),
        );
    }

    // ── Transitions ───────────────────────────────────────────────────────────

    /// Apply a state transition: validate against the table, drop in-flight
    /// work when leaving the driving states, emit `state:changed`, and
    /// persist the projection asynchronously (persistence failures are
    /// logged, never fatal).
    fn transition(&mut self, id: &str, to: SessionState, data: Option<Value>) -> bool {
        let Some(active) = self.sessions.get_mut(id) else {
            warn!(session = %id, "transition for unregistered session");
            return false;
        };
        let from = active.state;
        if from == to {
            return true;
        }
        if let Err(e) = check_transition(self.mode, from, to) {
            warn!(session = %id, error = %e, "transition rejected");
            return false;
        }

        active.state = to;
        if to.is_terminal() || to == SessionState::Paused {
            // Results of in-flight work for a stopped/paused session are
            // discarded on arrival by dropping the receivers now.
            active.turn = None;
            active.tool = None;
        }
        debug!(session = %id, %from, %to, "state changed");

        self.ctx.bus.publish(
            EventKind::StateChanged,
            Some(id),
            None,
            json!({"old_state": from.as_str(), "new_state": to.as_str()}),
        );

        let store = Arc::clone(&self.ctx.store);
        let session_id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store
                .set_fsm_state(&session_id, to.as_str(), data)
                .await
            {
                warn!(session = %session_id, error = %e, "failed to persist fsm state");
            }
        });
        true
    }
}

/// One model call for a session: load the document, build the filtered
/// request, resolve the provider, and normalize the result.
async fn run_turn(ctx: &KernelContext, id: &str) -> TurnOutcome {
    let doc = match ctx.store.load(id) {
        Ok(doc) => doc,
        Err(e) => return TurnOutcome::Failed(e.to_string()),
    };
    let (provider, model) = match ctx.providers.resolve(&doc.metadata.model) {
        Ok(resolved) => resolved,
        Err(e) => return TurnOutcome::Failed(e.to_string()),
    };
    let request = CompletionRequest {
        model,
        messages: to_wire_messages(doc.spec.system_prompt.as_deref(), &doc.spec.messages),
        tools: ctx.registry.schemas_for(doc.metadata.tools.as_deref()),
        max_tokens: ctx.config.model.max_tokens,
    };
    match provider.create_chat_completion(request).await {
        Ok(completion) => TurnOutcome::Completed(Box::new(completion)),
        Err(e) => TurnOutcome::Failed(e.to_string()),
    }
}
