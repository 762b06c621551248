// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod control;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use agentd_bus::{EventBus, EventKind};
use agentd_config::{Config, WorkspacePaths};
use agentd_engine::{ApprovalQueue, Engine, KernelContext, SessionState, TransitionMode};
use agentd_mcp::{register_remote_tools, McpSupervisor};
use agentd_model::{MockProvider, ProviderRegistry};
use agentd_policy::Ruleset;
use agentd_pty::{register_pty_tools, PtyEvent, PtyManager};
use agentd_store::{ChannelStore, SessionStore, StoreError};
use agentd_tools::{
    ExecuteShellTool, ListDirectoryTool, ReadFileTool, ToolRegistry, WriteFileTool,
};

use cli::{exit, Cli, Commands};

/// Session states that count as "active" for `--lock` / `--kill`.
const ACTIVE_STATES: &[&str] = &["pending", "running", "tool_exec", "human_input", "paused"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match agentd_config::load(cli.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(exit::CONFIG_ERROR);
        }
    };

    let code = match run_command(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            // Workspace / template problems are configuration errors; the
            // rest map to a failed session.
            if e.downcast_ref::<StoreError>().is_some_and(|se| {
                matches!(
                    se,
                    StoreError::TemplateNotFound(_) | StoreError::CorruptCounter(_)
                )
            }) {
                exit::CONFIG_ERROR
            } else {
                exit::SESSION_FAILED
            }
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Ok(path) = std::env::var("AGENTD_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
                .init();
            return;
        }
    }
    if verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_command(command: Commands, config: Arc<Config>) -> anyhow::Result<i32> {
    match command {
        Commands::Run => run_daemon(config).await,
        Commands::New {
            template,
            prompt,
            lock,
            kill,
            timeout,
        } => run_new(config, &template, prompt.as_deref(), lock, kill, timeout).await,
        Commands::Fork {
            session_id,
            prompt,
            timeout,
        } => run_fork(config, &session_id, prompt.as_deref(), timeout).await,
        Commands::List => run_list(config),
        Commands::Push { session_id, prompt } => run_push(config, &session_id, &prompt).await,
        Commands::Kill { session_id } => run_kill(config, &session_id).await,
        Commands::Watch { session_id } => run_watch(config, &session_id).await,
    }
}

// ── Kernel assembly ───────────────────────────────────────────────────────────

/// Build the full kernel: store, policy, tools, MCP fleet, PTY manager,
/// event bus, providers.
async fn build_kernel(config: Arc<Config>) -> anyhow::Result<KernelContext> {
    let paths = WorkspacePaths::resolve(config.workspace.as_deref());
    paths
        .ensure_layout()
        .context("workspace root is not writable")?;

    let store = Arc::new(SessionStore::open(paths.clone()).context("opening session store")?);
    let channels = Arc::new(ChannelStore::new(paths.clone()));

    let allowlist_path = match &config.tools.allowlist_file {
        Some(file) => {
            let p = std::path::PathBuf::from(file);
            if p.is_absolute() {
                p
            } else {
                paths.root().join(p)
            }
        }
        None => paths.allowlist_file(),
    };
    let ruleset = Arc::new(Ruleset::load(&allowlist_path).context("loading allowlist")?);

    let mut registry = ToolRegistry::new();
    registry.register(ExecuteShellTool::new(
        Arc::clone(&ruleset),
        config.tools.shell_timeout_secs,
    ));
    if config.tools.builtin_file_tools {
        registry.register(ReadFileTool);
        registry.register(WriteFileTool);
        registry.register(ListDirectoryTool);
    }

    let (pty, pty_events) = PtyManager::new(config.pty.clone());
    register_pty_tools(&mut registry, &pty);

    let mcp = Arc::new(McpSupervisor::new(paths.mcp_cache_dir()));
    for (name, server_config) in &config.mcp {
        mcp.add_server(name, server_config.clone());
    }
    // Servers without a schema cache are started eagerly to discover their
    // tools; cached servers start lazily on first call.
    for name in mcp.server_names() {
        if mcp.needs_eager_start(&name) {
            if let Err(e) = mcp.ensure_started(&name).await {
                warn!(server = %name, error = %e, "eager MCP start failed");
            }
        }
    }
    register_remote_tools(&mut registry, &mcp);

    let mut providers = ProviderRegistry::new();
    // Real provider adapters plug in here; the kernel itself ships only the
    // deterministic mock.
    providers.register(Arc::new(MockProvider::default()));

    let bus = Arc::new(EventBus::new());
    forward_pty_events(pty_events, Arc::clone(&bus));

    Ok(KernelContext {
        config,
        store,
        channels,
        registry: Arc::new(registry),
        providers: Arc::new(providers),
        mcp,
        pty,
        bus,
        approvals: Arc::new(ApprovalQueue::new()),
    })
}

/// Map PTY manager events onto bus events.
fn forward_pty_events(
    mut events: tokio::sync::mpsc::UnboundedReceiver<PtyEvent>,
    bus: Arc<EventBus>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Opened {
                    pty_id,
                    owner_session,
                } => {
                    bus.publish(
                        EventKind::PtyOpened,
                        Some(&owner_session),
                        None,
                        serde_json::json!({"pty_id": pty_id}),
                    );
                }
                PtyEvent::Output { pty_id, content } => {
                    bus.publish(
                        EventKind::PtyOutput,
                        None,
                        None,
                        serde_json::json!({"pty_id": pty_id, "content": content}),
                    );
                }
                PtyEvent::SubscriberOutput {
                    pty_id,
                    subscriber,
                    content,
                    last_line,
                } => {
                    bus.publish(
                        EventKind::PtyOutput,
                        None,
                        None,
                        serde_json::json!({
                            "pty_id": pty_id,
                            "subscriber": subscriber,
                            "content": content,
                            "last_read_line": last_line,
                        }),
                    );
                }
                PtyEvent::Closed {
                    pty_id,
                    exit_code,
                    signal,
                } => {
                    bus.publish(
                        EventKind::PtyClosed,
                        None,
                        None,
                        serde_json::json!({
                            "pty_id": pty_id,
                            "exit_code": exit_code,
                            "signal": signal,
                        }),
                    );
                }
            }
        }
    });
}

fn engine_mode(config: &Config) -> TransitionMode {
    if config.engine.strict_transitions {
        TransitionMode::Strict
    } else {
        TransitionMode::Permissive
    }
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn run_daemon(config: Arc<Config>) -> anyhow::Result<i32> {
    let ctx = build_kernel(Arc::clone(&config)).await?;
    let (mut engine, handle) = Engine::new(ctx.clone(), engine_mode(&config));
    engine.recover().await?;
    let engine_task = tokio::spawn(engine.run());

    // Observer surface: newline-JSON gateway frames on a local socket.
    let gateway = Arc::new(agentd_gateway::Gateway::new(ctx.clone(), handle.clone()));
    let socket = control::socket_path(ctx.store.paths().root());
    let control_task = tokio::spawn(control::serve(gateway, socket.clone()));

    info!("agentd running; press Ctrl-C to stop");
    wait_for_shutdown_signal().await;
    info!("shutting down");

    // Shutdown sequence: PTYs first, then the MCP fleet, then the farewell
    // broadcast, then the engine.
    ctx.pty.close_all().await;
    ctx.mcp.shutdown_all().await;
    ctx.bus.publish(
        EventKind::DaemonShutdown,
        None,
        None,
        serde_json::Value::Null,
    );
    handle.shutdown();
    let _ = engine_task.await;
    control_task.abort();
    let _ = std::fs::remove_file(&socket);
    Ok(exit::SUCCESS)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("SIGTERM handler installs");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_new(
    config: Arc<Config>,
    template: &str,
    prompt: Option<&str>,
    lock: bool,
    kill: bool,
    timeout: Option<u64>,
) -> anyhow::Result<i32> {
    let ctx = build_kernel(Arc::clone(&config)).await?;

    // `--lock` / `--kill`: look for other active sessions of this template.
    let active: Vec<String> = ctx
        .store
        .list()?
        .into_iter()
        .filter(|s| s.name == template && ACTIVE_STATES.contains(&s.state.as_str()))
        .map(|s| s.id)
        .collect();
    if lock && !active.is_empty() {
        eprintln!(
            "template {template:?} already has active session(s): {}",
            active.join(", ")
        );
        return Ok(exit::SESSION_FAILED);
    }
    if kill {
        for id in &active {
            ctx.store.set_fsm_state(id, "stopped", None).await?;
            info!(session = %id, "terminated by --kill");
        }
    }

    let id = ctx.store.new_session(template, prompt).await?;
    println!("{id}");
    if prompt.is_none() {
        // Nothing to run yet; the session waits for a push.
        return Ok(exit::SUCCESS);
    }
    if let Some(secs) = timeout {
        let mut doc = ctx.store.load(&id)?;
        doc.metadata.timeout = Some(secs);
        ctx.store.save(&id, &doc).await?;
    }

    drive_to_completion(ctx, config, &id).await
}

async fn run_fork(
    config: Arc<Config>,
    session_id: &str,
    prompt: Option<&str>,
    timeout: Option<u64>,
) -> anyhow::Result<i32> {
    let ctx = build_kernel(Arc::clone(&config)).await?;
    let id = ctx.store.fork(session_id, prompt).await?;
    ctx.bus.publish(
        EventKind::SessionForked,
        Some(&id),
        None,
        serde_json::json!({"parent_session_id": session_id}),
    );
    println!("{id}");
    if prompt.is_none() {
        return Ok(exit::SUCCESS);
    }
    if let Some(secs) = timeout {
        let mut doc = ctx.store.load(&id)?;
        doc.metadata.timeout = Some(secs);
        ctx.store.save(&id, &doc).await?;
    }
    drive_to_completion(ctx, config, &id).await
}

/// Run the engine until the session reaches a terminal state, printing the
/// assistant's replies, then map the outcome to an exit code.
async fn drive_to_completion(
    ctx: KernelContext,
    config: Arc<Config>,
    id: &str,
) -> anyhow::Result<i32> {
    let (engine, handle) = Engine::new(ctx.clone(), engine_mode(&config));
    let engine_task = tokio::spawn(engine.run());
    handle.register(id);

    let mut printed = 0usize;
    let state = loop {
        let doc = ctx.store.load(id)?;
        for message in doc.spec.messages.iter().skip(printed) {
            if message.role == agentd_model::Role::Assistant && !message.content.is_empty() {
                println!("{}", message.content);
            }
        }
        printed = doc.spec.messages.len();

        let state = doc
            .metadata
            .fsm_state
            .as_deref()
            .and_then(SessionState::parse)
            .unwrap_or(SessionState::Created);
        if state.is_terminal() {
            break state;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    handle.shutdown();
    let _ = engine_task.await;
    ctx.pty.close_all().await;
    ctx.mcp.shutdown_all().await;

    Ok(match state {
        SessionState::Success => exit::SUCCESS,
        SessionState::Failed => {
            let timed_out = ctx
                .store
                .load(id)?
                .metadata
                .fsm_state_data
                .is_some_and(|d| d["error"] == "session timeout");
            if timed_out {
                exit::TIMEOUT
            } else {
                exit::SESSION_FAILED
            }
        }
        _ => exit::SESSION_FAILED,
    })
}

fn run_list(config: Arc<Config>) -> anyhow::Result<i32> {
    let paths = WorkspacePaths::resolve(config.workspace.as_deref());
    paths.ensure_layout()?;
    let store = SessionStore::open(paths)?;
    for summary in store.list()? {
        println!(
            "{:>6}  {:<12} {:<16} {:<24} {}",
            summary.id,
            summary.state,
            summary.name,
            summary.model,
            summary.last_message.unwrap_or_default()
        );
    }
    Ok(exit::SUCCESS)
}

async fn run_push(config: Arc<Config>, session_id: &str, prompt: &str) -> anyhow::Result<i32> {
    let paths = WorkspacePaths::resolve(config.workspace.as_deref());
    paths.ensure_layout()?;
    let store = SessionStore::open(paths)?;
    store.push(session_id, prompt).await?;
    Ok(exit::SUCCESS)
}

async fn run_kill(config: Arc<Config>, session_id: &str) -> anyhow::Result<i32> {
    let paths = WorkspacePaths::resolve(config.workspace.as_deref());
    paths.ensure_layout()?;
    let store = SessionStore::open(paths)?;
    store.set_fsm_state(session_id, "stopped", None).await?;
    Ok(exit::SUCCESS)
}

/// Tail a session's log using its last-read cursor, so a second watcher
/// resumes where the previous one stopped.
async fn run_watch(config: Arc<Config>, session_id: &str) -> anyhow::Result<i32> {
    let paths = WorkspacePaths::resolve(config.workspace.as_deref());
    paths.ensure_layout()?;
    let store = SessionStore::open(paths)?;

    loop {
        let doc = store.load(session_id)?;
        let cursor = doc.metadata.last_read;
        let mut newest = cursor;
        for message in &doc.spec.messages {
            if cursor.map_or(true, |c| message.ts > c) {
                println!(
                    "[{}] {}: {}",
                    message.ts.format("%H:%M:%S"),
                    match message.role {
                        agentd_model::Role::System => "system",
                        agentd_model::Role::User => "user",
                        agentd_model::Role::Assistant => "assistant",
                        agentd_model::Role::Tool => "tool",
                    },
                    message.content
                );
                newest = Some(message.ts);
            }
        }
        if newest != cursor {
            if let Some(ts) = newest {
                store.update_last_read(session_id, ts).await?;
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(exit::SUCCESS),
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }
}

