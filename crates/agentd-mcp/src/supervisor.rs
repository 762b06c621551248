// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Fleet supervision for MCP servers.
//!
//! Each configured server is started lazily on its first tool call (or
//! eagerly at daemon startup when no schema cache exists).  A monitor task
//! watches the child's exit: unexpected exits restart the server after a
//! short backoff until `max_restarts` is exceeded, at which point the server
//! is marked permanently failed and callers see `ServerDown`.  A per-request
//! timeout is not a crash — the server keeps running and the restart counter
//! is untouched.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use agentd_config::McpServerConfig;

use crate::cache::{RemoteToolSpec, SchemaCache};
use crate::error::McpError;
use crate::process::McpProcess;

/// Operational timeouts, overridable in tests.
#[derive(Debug, Clone, Copy)]
pub struct McpTimeouts {
    pub request: Duration,
    pub ready: Duration,
    pub restart_backoff: Duration,
}

impl Default for McpTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(30),
            ready: Duration::from_secs(10),
            restart_backoff: Duration::from_secs(2),
        }
    }
}

pub struct McpServer {
    pub name: String,
    pub config: McpServerConfig,
    proc: AsyncMutex<Option<Arc<McpProcess>>>,
    restart_count: AtomicU32,
    failed: AtomicBool,
    tools: StdMutex<Vec<RemoteToolSpec>>,
}

impl McpServer {
    fn new(name: String, config: McpServerConfig) -> Self {
        Self {
            name,
            config,
            proc: AsyncMutex::new(None),
            restart_count: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            tools: StdMutex::new(Vec::new()),
        }
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn tools(&self) -> Vec<RemoteToolSpec> {
        self.tools.lock().expect("tools lock poisoned").clone()
    }
}

pub struct McpSupervisor {
    cache_dir: PathBuf,
    timeouts: McpTimeouts,
    servers: StdMutex<HashMap<String, Arc<McpServer>>>,
    shutting_down: AtomicBool,
}

impl McpSupervisor {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self::with_timeouts(cache_dir, McpTimeouts::default())
    }

    pub fn with_timeouts(cache_dir: PathBuf, timeouts: McpTimeouts) -> Self {
        Self {
            cache_dir,
            timeouts,
            servers: StdMutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Register a configured server.  Does not start it.
    pub fn add_server(&self, name: &str, config: McpServerConfig) -> Arc<McpServer> {
        let server = Arc::new(McpServer::new(name.to_string(), config));
        // Pre-seed tool specs from a schema cache when one exists, so the
        // tools can be registered before the first start.
        if let Some(cache) = SchemaCache::load(&self.cache_dir, name) {
            *server.tools.lock().expect("tools lock poisoned") =
                cache.tools.into_values().collect();
        }
        self.servers
            .lock()
            .expect("server table poisoned")
            .insert(name.to_string(), Arc::clone(&server));
        server
    }

    pub fn server(&self, name: &str) -> Option<Arc<McpServer>> {
        self.servers
            .lock()
            .expect("server table poisoned")
            .get(name)
            .cloned()
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .servers
            .lock()
            .expect("server table poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// `true` when this server has no schema cache yet and should be
    /// started eagerly at daemon startup to discover its tools.
    pub fn needs_eager_start(&self, name: &str) -> bool {
        SchemaCache::load(&self.cache_dir, name).is_none()
    }

    /// Start a server if it is not already running: spawn, initialize,
    /// discover tools, persist the schema cache, and attach the crash
    /// monitor.
    pub fn ensure_started<'a>(
        self: &'a Arc<Self>,
        name: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), McpError>> + Send + 'a>>
    {
        Box::pin(self.ensure_started_inner(name))
    }

    async fn ensure_started_inner(self: &Arc<Self>, name: &str) -> Result<(), McpError> {
        let server = self
            .server(name)
            .ok_or_else(|| McpError::NotConfigured(name.to_string()))?;
        if server.is_failed() {
            return Err(McpError::ServerDown(name.to_string()));
        }

        let mut slot = server.proc.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let proc = McpProcess::spawn(&server.name, &server.config)?;

        // The crash monitor attaches before the handshake so a child that
        // dies mid-initialize still enters the restart path.  The pointer
        // guard keeps a stale monitor from clearing a newer process.
        if let Some(exit) = proc.take_exit_signal() {
            let supervisor = Arc::clone(self);
            let server = Arc::clone(&server);
            let watched = Arc::clone(&proc);
            tokio::spawn(async move {
                let _ = exit.await;
                {
                    let mut slot = server.proc.lock().await;
                    if slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, &watched)) {
                        *slot = None;
                    }
                }
                if supervisor.shutting_down.load(Ordering::Acquire) {
                    return;
                }
                let count = server.restart_count.fetch_add(1, Ordering::AcqRel) + 1;
                if count > server.config.max_restarts {
                    warn!(
                        server = %server.name,
                        count,
                        "mcp server exceeded max restarts; marking failed"
                    );
                    server.failed.store(true, Ordering::Release);
                    return;
                }
                info!(server = %server.name, attempt = count, "restarting mcp server");
                tokio::time::sleep(supervisor.timeouts.restart_backoff).await;
                if let Err(e) = supervisor.ensure_started(&server.name).await {
                    warn!(server = %server.name, error = %e, "mcp restart failed");
                }
            });
        }

        if let Err(e) = proc.initialize(self.timeouts.ready).await {
            proc.kill();
            return Err(e);
        }

        let listed = match proc
            .request("tools/list", json!({}), self.timeouts.request)
            .await
        {
            Ok(listed) => listed,
            Err(e) => {
                proc.kill();
                return Err(e);
            }
        };
        let specs: Vec<RemoteToolSpec> = listed
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| serde_json::from_value(t.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        if let Err(e) = SchemaCache::new(&server.name, specs.clone()).save(&self.cache_dir) {
            warn!(server = %server.name, error = %e, "failed to write schema cache");
        }
        *server.tools.lock().expect("tools lock poisoned") = specs;

        info!(server = %server.name, "mcp server started");
        *slot = Some(proc);
        Ok(())
    }

    /// Invoke a remote tool: lazy-starts the server, sends `tools/call`,
    /// and returns the raw `result` value.
    pub async fn call_tool(
        self: &Arc<Self>,
        server_name: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        self.ensure_started(server_name).await?;
        let server = self
            .server(server_name)
            .ok_or_else(|| McpError::NotConfigured(server_name.to_string()))?;
        let proc = {
            let slot = server.proc.lock().await;
            slot.clone()
                .ok_or_else(|| McpError::ServerDown(server_name.to_string()))?
        };
        proc.request(
            "tools/call",
            json!({"name": tool, "arguments": arguments}),
            self.timeouts.request,
        )
        .await
    }

    /// Shut the fleet down: best-effort `shutdown` RPC, then kill after a
    /// one-second grace.  Suppresses all pending restarts.
    pub async fn shutdown_all(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let servers: Vec<Arc<McpServer>> = self
            .servers
            .lock()
            .expect("server table poisoned")
            .values()
            .cloned()
            .collect();

        for server in servers {
            let proc = { server.proc.lock().await.clone() };
            if let Some(proc) = proc {
                // `shutdown` is a convention, not a guaranteed method:
                // tolerate a non-response, then SIGTERM.
                let _ = proc
                    .request("shutdown", json!({}), Duration::from_secs(1))
                    .await;
                proc.terminate();
                info!(server = %server.name, "mcp server stopped");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_timeouts() -> McpTimeouts {
        McpTimeouts {
            request: Duration::from_millis(300),
            ready: Duration::from_millis(300),
            restart_backoff: Duration::from_millis(20),
        }
    }

    fn script_config(script: &str, max_restarts: u32) -> McpServerConfig {
        McpServerConfig {
            command: "bash".into(),
            args: vec!["-c".into(), script.into()],
            env: Default::default(),
            cwd: None,
            policy: Default::default(),
            max_restarts,
        }
    }

    /// Answers initialize (id 1), tools/list (id 2), and one tools/call
    /// (id 3), then keeps the pipe open.
    const FULL_SERVER: &str = r#"
read line; printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}\n'
read line
read line; printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"greet","description":"greets","inputSchema":{"type":"object"}}]}}\n'
read line; printf '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hi there"}],"isError":false}}\n'
while read line; do :; done
"#;

    fn supervisor(dir: &std::path::Path) -> Arc<McpSupervisor> {
        Arc::new(McpSupervisor::with_timeouts(
            dir.to_path_buf(),
            test_timeouts(),
        ))
    }

    #[tokio::test]
    async fn start_discovers_tools_and_writes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.add_server("greeter", script_config(FULL_SERVER, 0));

        sup.ensure_started("greeter").await.unwrap();

        let server = sup.server("greeter").unwrap();
        let tools = server.tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "greet");
        assert!(SchemaCache::load(dir.path(), "greeter").is_some());
    }

    #[tokio::test]
    async fn call_tool_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.add_server("greeter", script_config(FULL_SERVER, 0));

        let result = sup
            .call_tool("greeter", "greet", json!({"who": "world"}))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "hi there");
    }

    #[tokio::test]
    async fn request_timeout_does_not_increment_restart_count() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        // Answers the handshake, then goes silent — tools/call times out
        // while the process stays alive.
        let script = r#"
read line; printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}\n'
read line
read line; printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}\n'
while read line; do :; done
"#;
        sup.add_server("silent", script_config(script, 3));

        let err = sup
            .call_tool("silent", "anything", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "MCP request timeout for silent");
        assert_eq!(sup.server("silent").unwrap().restart_count(), 0);
    }

    #[tokio::test]
    async fn crash_exceeding_max_restarts_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        // Dies before answering the handshake, every time.
        sup.add_server("flaky", script_config("exit 1", 1));

        assert!(sup.ensure_started("flaky").await.is_err());

        // Let the monitor run through its restart budget.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let server = sup.server("flaky").unwrap();
        assert!(server.restart_count() >= 1);

        // Eventually the server is failed and callers get ServerDown.
        for _ in 0..50 {
            if server.is_failed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(server.is_failed());
        let err = sup.call_tool("flaky", "x", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ServerDown(_)));
    }

    #[tokio::test]
    async fn unconfigured_server_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let err = sup.call_tool("ghost", "x", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn cached_schema_registers_tools_before_start() {
        let dir = tempfile::tempdir().unwrap();
        SchemaCache::new(
            "cached",
            vec![RemoteToolSpec {
                name: "lookup".into(),
                description: "looks up".into(),
                input_schema: json!({"type": "object"}),
            }],
        )
        .save(dir.path())
        .unwrap();

        let sup = supervisor(dir.path());
        let server = sup.add_server("cached", script_config(FULL_SERVER, 0));
        // Tools are visible without the server ever starting.
        assert_eq!(server.tools()[0].name, "lookup");
        assert!(!sup.needs_eager_start("cached"));
        assert!(sup.needs_eager_start("uncached"));
    }

    #[tokio::test]
    async fn shutdown_suppresses_restart() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.add_server("greeter", script_config(FULL_SERVER, 5));
        sup.ensure_started("greeter").await.unwrap();

        sup.shutdown_all().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let server = sup.server("greeter").unwrap();
        assert_eq!(server.restart_count(), 0, "shutdown must not count as a crash");
    }
}
