// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Full-assembly integration tests: the kernel wired exactly as the daemon
//! wires it, driven through the gateway.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use agentd_bus::EventBus;
use agentd_config::{Config, WorkspacePaths};
use agentd_engine::{ApprovalQueue, Engine, KernelContext, TransitionMode};
use agentd_gateway::{Gateway, GatewayEvent, GatewayRequest};
use agentd_mcp::McpSupervisor;
use agentd_model::{MockProvider, ProviderRegistry, Role, ScriptedProvider};
use agentd_policy::Ruleset;
use agentd_pty::{register_pty_tools, PtyManager};
use agentd_store::{
    ChannelStore, SessionDocument, SessionMetadata, SessionSpec, SessionStore, API_VERSION,
    KIND_AGENT,
};
use agentd_tools::{ExecuteShellTool, ListDirectoryTool, ReadFileTool, ToolRegistry};

fn template(model: &str) -> SessionDocument {
    SessionDocument {
        api_version: API_VERSION.into(),
        kind: KIND_AGENT.into(),
        metadata: SessionMetadata {
            name: "solo".into(),
            model: model.into(),
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
            system_prompt: Some("You run on {{os}}.".into()),
            messages: vec![],
        },
    }
}

/// Assemble the kernel the same way the daemon does, with both the mock
/// echo provider and a scripted provider registered.
fn kernel(dir: &std::path::Path, scripted: Option<ScriptedProvider>) -> Gateway {
    let paths = WorkspacePaths::at(dir);
    paths.ensure_layout().unwrap();

    let mut config = Config::default();
    config.engine.tick_ms = 10;
    config.pty.shell = Some("sh".into());

    let store = Arc::new(SessionStore::open(paths.clone()).unwrap());

    let ruleset = Arc::new(Ruleset::load(&paths.allowlist_file()).unwrap());
    let mut registry = ToolRegistry::new();
    registry.register(ExecuteShellTool::new(ruleset, 10));
    registry.register(ReadFileTool);
    registry.register(ListDirectoryTool);
    let (pty, _pty_events) = PtyManager::new(config.pty.clone());
    register_pty_tools(&mut registry, &pty);

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(MockProvider::default()));
    if let Some(p) = scripted {
        providers.register(Arc::new(p));
    }

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
    Gateway::new(ctx, handle)
}

async fn wait_for_state(gw: &Gateway, id: &str, expected: &str) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = gw
            .context()
            .store
            .load(id)
            .ok()
            .and_then(|d| d.metadata.fsm_state)
            .unwrap_or_default();
        if state == expected {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "session {id} stuck in {state:?}, wanted {expected:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn mock_conversation_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let gw = kernel(dir.path(), None);
    gw.context()
        .store
        .save_template("solo", &template("mock:echo"))
        .unwrap();

    let id = gw
        .context()
        .store
        .new_session("solo", Some("hello daemon"))
        .await
        .unwrap();
    gw.engine().register(&id);

    wait_for_state(&gw, &id, "success").await;
    let doc = gw.context().store.load(&id).unwrap();
    assert_eq!(
        doc.spec.messages.last().unwrap().content,
        "MOCK: hello daemon"
    );
    // The rendered system prompt replaced the OS variable.
    assert!(!doc.spec.system_prompt.unwrap().contains("{{os}}"));
}

#[tokio::test]
async fn shell_tool_call_flows_through_gateway_approval() {
    let dir = tempfile::tempdir().unwrap();
    let scripted = ScriptedProvider::tool_then_text(
        "call-1",
        "execute_shell",
        json!({"command": "uname -sr"}),
        "all done",
    );
    let gw = kernel(dir.path(), Some(scripted));
    gw.context()
        .store
        .save_template("solo", &template("scripted:test"))
        .unwrap();

    let id = gw
        .context()
        .store
        .new_session("solo", None)
        .await
        .unwrap();
    gw.handle(GatewayRequest::MessageSubmit {
        session_id: id.clone(),
        content: "what kernel is this?".into(),
    })
    .await;

    // `uname` has no allowlist rule: the session parks for approval.
    wait_for_state(&gw, &id, "human_input").await;
    let approval = gw.context().approvals.pending().remove(0);
    gw.handle(GatewayRequest::ToolApprove {
        approval_id: approval.id,
    })
    .await;

    wait_for_state(&gw, &id, "success").await;
    let doc = gw.context().store.load(&id).unwrap();
    let tool_msg = doc
        .spec
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool result recorded");
    assert!(!tool_msg.content.is_empty(), "uname output captured");
    assert_eq!(doc.spec.messages.last().unwrap().content, "all done");
}

#[tokio::test]
async fn init_frame_reflects_new_sessions_and_events() {
    let dir = tempfile::tempdir().unwrap();
    let gw = kernel(dir.path(), None);
    gw.context()
        .store
        .save_template("solo", &template("mock:echo"))
        .unwrap();

    gw.handle(GatewayRequest::ChannelCreate {
        name: "lobby".into(),
        description: None,
    })
    .await;
    let invited = gw
        .handle(GatewayRequest::AgentInvite {
            channel: "lobby".into(),
            template: "solo".into(),
            prompt: Some("hi".into()),
        })
        .await;
    let session_id = match &invited[0] {
        GatewayEvent::AgentInvited { session_id, .. } => session_id.clone(),
        other => panic!("expected invite ack, got {other:?}"),
    };

    wait_for_state(&gw, &session_id, "success").await;

    match gw.init_frame() {
        GatewayEvent::Init {
            channels,
            sessions,
            events,
        } => {
            assert_eq!(channels.len(), 1);
            assert_eq!(channels[0].spec.agent_sessions, vec![session_id.clone()]);
            assert_eq!(sessions.len(), 1);
            assert_eq!(sessions[0].state, "success");
            assert!(!events.is_empty(), "init frame carries an event tail");
        }
        other => panic!("expected init frame, got {other:?}"),
    }
}
