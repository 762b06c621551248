// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Engine integration tests: scripted providers drive full FSM
//! trajectories against a real store in a tempdir.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use agentd_bus::{EventBus, EventKind};
use agentd_config::{Config, PtyConfig, WorkspacePaths};
use agentd_mcp::McpSupervisor;
use agentd_model::{
    ChatCompletion, CompletionRequest, LlmProvider, ProviderRegistry, Role, ScriptTurn,
    ScriptedProvider,
};
use agentd_policy::Ruleset;
use agentd_pty::PtyManager;
use agentd_store::{
    ChannelStore, SessionDocument, SessionMetadata, SessionSpec, SessionStore, API_VERSION,
    KIND_AGENT,
};
use agentd_tools::{ExecuteShellTool, ListDirectoryTool, ToolRegistry, WriteFileTool};

use crate::approvals::ApprovalQueue;
use crate::context::KernelContext;
use crate::engine::{Engine, EngineHandle};
use crate::fsm::TransitionMode;

struct Harness {
    _dir: tempfile::TempDir,
    ctx: KernelContext,
    handle: EngineHandle,
}

fn template() -> SessionDocument {
    SessionDocument {
        api_version: API_VERSION.into(),
        kind: KIND_AGENT.into(),
        metadata: SessionMetadata {
            name: "solo".into(),
            model: "scripted:test".into(),
            created_at: Utc::now(),
            labels: None,
            tools: None,
            pid: None,
            timeout: None,
            start_time: None,
            last_read: None,
            fsm_state: None,
            fsm_state_data: None,
            usage: None,
            provider: None,
        },
        spec: SessionSpec {
            system_prompt: Some("You are a local agent.".into()),
            messages: vec![],
        },
    }
}

fn harness_with(provider: Arc<dyn LlmProvider>, tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let paths = WorkspacePaths::at(dir.path());
    paths.ensure_layout().unwrap();

    let mut config = Config::default();
    config.engine.tick_ms = 10;
    tweak(&mut config);

    let store = Arc::new(SessionStore::open(paths.clone()).unwrap());
    store.save_template("solo", &template()).unwrap();

    let mut providers = ProviderRegistry::new();
    providers.register(provider);

    let mut registry = ToolRegistry::new();
    registry.register(ExecuteShellTool::new(Arc::new(Ruleset::default_rules()), 10));
    registry.register(ListDirectoryTool);
    registry.register(WriteFileTool);

    let (pty, _pty_events) = PtyManager::new(PtyConfig::default());
    let ctx = KernelContext {
        config: Arc::new(config),
        store,
        channels: Arc::new(ChannelStore::new(paths.clone())),
        registry: Arc::new(registry),
        providers: Arc::new(providers),
        mcp: Arc::new(McpSupervisor::new(paths.mcp_cache_dir())),
        pty,
        bus: Arc::new(EventBus::new()),
        approvals: Arc::new(ApprovalQueue::new()),
    };

    let (engine, handle) = Engine::new(ctx.clone(), TransitionMode::Permissive);
    tokio::spawn(engine.run());

    Harness {
        _dir: dir,
        ctx,
        handle,
    }
}

async fn wait_for_state(ctx: &KernelContext, id: &str, expected: &str, timeout_ms: u64) {
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let state = ctx
            .store
            .load(id)
            .ok()
            .and_then(|d| d.metadata.fsm_state)
            .unwrap_or_default();
        if state == expected {
            return;
        }
        if std::time::Instant::now() > deadline {
            panic!("session {id} never reached {expected:?}; last state {state:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn single_tool_turn_runs_the_full_trajectory() {
    // The model returns one list_directory call, then a terminating turn:
    // pending → running → tool_exec → running → success.
    let provider = Arc::new(ScriptedProvider::tool_then_text(
        "call-1",
        "list_directory",
        json!({"path": "."}),
        "done",
    ));
    let h = harness_with(provider, |_| {});

    let mut events = h.ctx.bus.subscribe();
    let id = h
        .ctx
        .store
        .new_session("solo", Some("list files"))
        .await
        .unwrap();
    h.handle.register(&id);

    wait_for_state(&h.ctx, &id, "success", 5000).await;

    // Observed state trajectory.
    let mut trajectory = vec!["pending".to_string()];
    while let Ok(ev) = events.try_recv() {
        if ev.kind == EventKind::StateChanged {
            trajectory.push(ev.data["new_state"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(
        trajectory,
        vec!["pending", "running", "tool_exec", "running", "success"]
    );

    // The log interleaves correctly: user, assistant+call, tool, assistant.
    let doc = h.ctx.store.load(&id).unwrap();
    let roles: Vec<Role> = doc.spec.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert_eq!(
        doc.spec.messages[2].tool_call_id.as_deref(),
        Some("call-1")
    );
    assert_eq!(doc.spec.messages[3].content, "done");
    assert_eq!(
        doc.spec.messages[3].finish_reason.as_deref(),
        Some("stop")
    );
}

#[tokio::test]
async fn unlisted_shell_command_parks_in_human_input_until_approved() {
    let provider = Arc::new(ScriptedProvider::tool_then_text(
        "call-1",
        "execute_shell",
        json!({"command": "echo approved_path && true"}),
        "finished",
    ));
    let h = harness_with(provider, |_| {});

    let id = h
        .ctx
        .store
        .new_session("solo", Some("run it"))
        .await
        .unwrap();
    h.handle.register(&id);

    wait_for_state(&h.ctx, &id, "human_input", 5000).await;
    let pending = h.ctx.approvals.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].session_id, id);
    assert!(pending[0].prompt.contains("echo approved_path"));

    h.handle.resolve_approval(&pending[0].id, true, None);
    wait_for_state(&h.ctx, &id, "success", 5000).await;

    let doc = h.ctx.store.load(&id).unwrap();
    let tool_msg = doc
        .spec
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool result present");
    assert!(tool_msg.content.contains("approved_path"));
}

#[tokio::test]
async fn rejected_approval_synthesizes_denial_and_continues() {
    let provider = Arc::new(ScriptedProvider::tool_then_text(
        "call-1",
        "execute_shell",
        json!({"command": "make deploy"}),
        "understood",
    ));
    let h = harness_with(provider, |_| {});

    let id = h.ctx.store.new_session("solo", Some("go")).await.unwrap();
    h.handle.register(&id);

    wait_for_state(&h.ctx, &id, "human_input", 5000).await;
    let approval = h.ctx.approvals.pending().remove(0);
    h.handle.resolve_approval(&approval.id, false, None);

    wait_for_state(&h.ctx, &id, "success", 5000).await;
    let doc = h.ctx.store.load(&id).unwrap();
    let tool_msg = doc
        .spec
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert_eq!(tool_msg.content, "denied by user");
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call-1"));
}

#[tokio::test]
async fn operator_reply_becomes_the_tool_result() {
    let provider = Arc::new(ScriptedProvider::tool_then_text(
        "call-1",
        "execute_shell",
        json!({"command": "deploy --prod"}),
        "noted",
    ));
    let h = harness_with(provider, |_| {});

    let id = h.ctx.store.new_session("solo", Some("deploy")).await.unwrap();
    h.handle.register(&id);

    wait_for_state(&h.ctx, &id, "human_input", 5000).await;
    let approval = h.ctx.approvals.pending().remove(0);
    h.handle
        .resolve_approval(&approval.id, true, Some("deploys are frozen until Monday".into()));

    wait_for_state(&h.ctx, &id, "success", 5000).await;
    let doc = h.ctx.store.load(&id).unwrap();
    let tool_msg = doc
        .spec
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert_eq!(tool_msg.content, "deploys are frozen until Monday");
}

#[tokio::test]
async fn unanswered_approval_expires_into_denied_timeout() {
    let provider = Arc::new(ScriptedProvider::tool_then_text(
        "call-1",
        "execute_shell",
        json!({"command": "make test"}),
        "ok",
    ));
    let h = harness_with(provider, |cfg| {
        cfg.engine.approval_timeout_secs = Some(0);
    });

    let id = h.ctx.store.new_session("solo", Some("go")).await.unwrap();
    h.handle.register(&id);

    wait_for_state(&h.ctx, &id, "success", 5000).await;
    let doc = h.ctx.store.load(&id).unwrap();
    let tool_msg = doc
        .spec
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert_eq!(tool_msg.content, "denied (timeout)");
}

#[tokio::test]
async fn denied_allowlist_command_fails_without_an_approval_request() {
    // `rm -rf /` is denied outright: no approval entry, session continues.
    let provider = Arc::new(ScriptedProvider::tool_then_text(
        "call-1",
        "execute_shell",
        json!({"command": "rm -rf /"}),
        "acknowledged",
    ));
    let h = harness_with(provider, |_| {});

    let id = h.ctx.store.new_session("solo", Some("clean up")).await.unwrap();
    h.handle.register(&id);

    wait_for_state(&h.ctx, &id, "success", 5000).await;
    assert!(h.ctx.approvals.is_empty());
    let doc = h.ctx.store.load(&id).unwrap();
    let tool_msg = doc
        .spec
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool_msg.content.contains("denied by allowlist"));
}

#[tokio::test]
async fn session_timeout_transitions_to_failed() {
    struct NeverProvider;

    #[async_trait]
    impl LlmProvider for NeverProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn create_chat_completion(
            &self,
            _req: CompletionRequest,
        ) -> anyhow::Result<ChatCompletion> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    let h = harness_with(Arc::new(NeverProvider), |cfg| {
        cfg.engine.session_timeout_secs = Some(0);
    });

    let id = h.ctx.store.new_session("solo", Some("hang")).await.unwrap();
    h.handle.register(&id);

    wait_for_state(&h.ctx, &id, "failed", 5000).await;
    let doc = h.ctx.store.load(&id).unwrap();
    assert_eq!(
        doc.metadata.fsm_state_data.unwrap()["error"],
        "session timeout"
    );
}

#[tokio::test]
async fn stop_discards_the_in_flight_turn() {
    struct SlowProvider;

    #[async_trait]
    impl LlmProvider for SlowProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn create_chat_completion(
            &self,
            _req: CompletionRequest,
        ) -> anyhow::Result<ChatCompletion> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    let h = harness_with(Arc::new(SlowProvider), |_| {});

    let id = h.ctx.store.new_session("solo", Some("slow")).await.unwrap();
    h.handle.register(&id);
    wait_for_state(&h.ctx, &id, "running", 5000).await;

    h.handle.stop(&id);
    wait_for_state(&h.ctx, &id, "stopped", 5000).await;

    // No assistant message ever lands: the result is discarded.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let doc = h.ctx.store.load(&id).unwrap();
    assert!(doc
        .spec
        .messages
        .iter()
        .all(|m| m.role != Role::Assistant));
}

#[tokio::test]
async fn retry_reenters_pending_from_failed() {
    // First turn errors (no provider for the model), after retry the fixed
    // provider answers.
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptTurn::text("recovered")]));
    let h = harness_with(provider, |_| {});

    let id = h.ctx.store.new_session("solo", Some("hi")).await.unwrap();
    // Sabotage the model so the first run fails.
    let mut doc = h.ctx.store.load(&id).unwrap();
    doc.metadata.model = "missing:model".into();
    h.ctx.store.save(&id, &doc).await.unwrap();

    h.handle.register(&id);
    wait_for_state(&h.ctx, &id, "failed", 5000).await;

    // Fix the model and retry.
    let mut doc = h.ctx.store.load(&id).unwrap();
    doc.metadata.model = "scripted:test".into();
    h.ctx.store.save(&id, &doc).await.unwrap();
    h.handle.retry(&id);

    wait_for_state(&h.ctx, &id, "success", 5000).await;
    let doc = h.ctx.store.load(&id).unwrap();
    assert_eq!(doc.spec.messages.last().unwrap().content, "recovered");
}

#[tokio::test]
async fn pause_parks_the_session_until_resumed() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptTurn::text("first answer"),
        ScriptTurn::text("after resume"),
    ]));
    let h = harness_with(provider, |_| {});

    let id = h.ctx.store.new_session("solo", Some("question")).await.unwrap();
    h.handle.register(&id);
    h.handle.pause(&id);

    wait_for_state(&h.ctx, &id, "paused", 5000).await;
    // A paused session does not advance on its own.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let doc = h.ctx.store.load(&id).unwrap();
    assert_eq!(doc.metadata.fsm_state.as_deref(), Some("paused"));

    h.handle.resume(&id);
    wait_for_state(&h.ctx, &id, "success", 5000).await;
    let doc = h.ctx.store.load(&id).unwrap();
    assert_eq!(doc.spec.messages.last().unwrap().role, Role::Assistant);
}

#[tokio::test]
async fn recovery_promotes_user_tail_to_pending() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptTurn::text("resumed")]));
    let dir = tempfile::tempdir().unwrap();
    let paths = WorkspacePaths::at(dir.path());
    paths.ensure_layout().unwrap();

    let store = Arc::new(SessionStore::open(paths.clone()).unwrap());
    store.save_template("solo", &template()).unwrap();
    let id = store.new_session("solo", Some("unanswered")).await.unwrap();
    // Simulate a pre-crash state: document says success, log ends in a
    // user message.
    store.set_fsm_state(&id, "success", None).await.unwrap();

    let mut config = Config::default();
    config.engine.tick_ms = 10;
    let mut providers = ProviderRegistry::new();
    providers.register(provider);
    let (pty, _pty_events) = PtyManager::new(PtyConfig::default());
    let ctx = KernelContext {
        config: Arc::new(config),
        store: Arc::clone(&store),
        channels: Arc::new(ChannelStore::new(paths.clone())),
        registry: Arc::new(ToolRegistry::new()),
        providers: Arc::new(providers),
        mcp: Arc::new(McpSupervisor::new(paths.mcp_cache_dir())),
        pty,
        bus: Arc::new(EventBus::new()),
        approvals: Arc::new(ApprovalQueue::new()),
    };

    let (mut engine, _handle) = Engine::new(ctx.clone(), TransitionMode::Permissive);
    engine.recover().await.unwrap();
    tokio::spawn(engine.run());

    wait_for_state(&ctx, &id, "success", 5000).await;
    let doc = store.load(&id).unwrap();
    assert_eq!(doc.spec.messages.last().unwrap().content, "resumed");
}
