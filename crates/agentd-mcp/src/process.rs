// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! One running MCP server child process.
//!
//! The wire is newline-delimited JSON-RPC 2.0 on stdin/stdout; stderr is
//! drained into the log.  A reader task accumulates a byte buffer, splits it
//! on `\n`, and resolves waiters from the pending map by request id.  When
//! the reader hits EOF every outstanding waiter fails with `ServerDown` and
//! the exit notification fires so the supervisor can decide on a restart.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use agentd_config::McpServerConfig;

use crate::error::McpError;

/// MCP protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value, McpError>>>>>;

pub struct McpProcess {
    name: String,
    pid: Option<u32>,
    stdin: AsyncMutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    ready: AtomicBool,
    /// Ask the wait task to SIGKILL the child.
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
    /// Fires once when the child has exited.
    exit_rx: StdMutex<Option<oneshot::Receiver<()>>>,
}

impl McpProcess {
    /// Spawn the child and attach the stdio tasks.  The process is not yet
    /// `ready` — callers run [`McpProcess::initialize`] next.
    pub fn spawn(name: &str, config: &McpServerConfig) -> Result<Arc<Self>, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| McpError::Spawn {
            server: name.to_string(),
            source,
        })?;

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let pid = child.id();

        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel::<()>();

        let proc = Arc::new(Self {
            name: name.to_string(),
            pid,
            stdin: AsyncMutex::new(stdin),
            pending: Arc::clone(&pending),
            next_id: AtomicU64::new(1),
            ready: AtomicBool::new(false),
            kill_tx: StdMutex::new(Some(kill_tx)),
            exit_rx: StdMutex::new(Some(exit_rx)),
        });

        // Reader task: byte buffer → lines → dispatch.
        {
            let pending = Arc::clone(&pending);
            let server = name.to_string();
            let mut stdout = stdout;
            tokio::spawn(async move {
                let mut buf: Vec<u8> = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match stdout.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                                let line: Vec<u8> = buf.drain(..=pos).collect();
                                dispatch_line(&server, &line[..line.len() - 1], &pending);
                            }
                        }
                    }
                }
                // EOF: fail everything still waiting.
                let mut map = pending.lock().expect("mcp pending map poisoned");
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(McpError::ServerDown(server.clone())));
                }
            });
        }

        // Stderr task: forward to the log.
        {
            let server = name.to_string();
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "stderr: {line}");
                }
            });
        }

        // Wait task: owns the child; reaps it and reports the exit.
        {
            let server = name.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        debug!(server = %server, ?status, "mcp server exited");
                    }
                    _ = &mut kill_rx => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        debug!(server = %server, "mcp server killed");
                    }
                }
                let _ = exit_tx.send(());
            });
        }

        Ok(proc)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Take the exit notification; the supervisor's monitor consumes it.
    pub fn take_exit_signal(&self) -> Option<oneshot::Receiver<()>> {
        self.exit_rx.lock().expect("exit slot poisoned").take()
    }

    /// Ask the wait task to SIGKILL the child.
    pub fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().expect("kill slot poisoned").take() {
            let _ = tx.send(());
        }
    }

    /// Graceful stop: SIGTERM, leaving the wait task to reap the child.
    /// Falls back to a hard kill on platforms without signals.
    pub fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            return;
        }
        self.kill();
    }

    /// `initialize` handshake; the process is `ready` after the first
    /// successful response.
    pub async fn initialize(&self, timeout: Duration) -> Result<(), McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "agentd", "version": env!("CARGO_PKG_VERSION")},
        });
        self.request("initialize", params, timeout).await?;
        self.ready.store(true, Ordering::Release);
        self.notify("notifications/initialized", json!({})).await?;
        Ok(())
    }

    /// Send a request and await its correlated response.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("mcp pending map poisoned")
            .insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write_frame(&frame).await {
            self.pending
                .lock()
                .expect("mcp pending map poisoned")
                .remove(&id);
            warn!(server = %self.name, error = %e, "mcp write failed");
            return Err(McpError::ServerDown(self.name.clone()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ServerDown(self.name.clone())),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("mcp pending map poisoned")
                    .remove(&id);
                Err(McpError::Timeout(self.name.clone()))
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &Value) -> Result<(), McpError> {
        let mut line = serde_json::to_vec(frame).expect("frame serializes");
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Handle one complete line from the server's stdout.
fn dispatch_line(server: &str, line: &[u8], pending: &Pending) {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return;
    }
    let msg: Value = match serde_json::from_slice(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(server, error = %e, "mcp: unparseable line");
            return;
        }
    };

    let Some(id) = msg.get("id").and_then(Value::as_u64) else {
        // Server-initiated request or notification; we do not serve any.
        debug!(server, method = msg["method"].as_str().unwrap_or("?"), "mcp notification");
        return;
    };

    let Some(tx) = pending
        .lock()
        .expect("mcp pending map poisoned")
        .remove(&id)
    else {
        warn!(server, id, "mcp: response with unknown id");
        return;
    };

    let outcome = if let Some(err) = msg.get("error") {
        Err(McpError::Protocol {
            server: server.to_string(),
            message: err["message"].as_str().unwrap_or("unknown error").to_string(),
        })
    } else {
        Ok(msg.get("result").cloned().unwrap_or(Value::Null))
    };
    let _ = tx.send(outcome);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config(script: &str) -> McpServerConfig {
        McpServerConfig {
            command: "bash".into(),
            args: vec!["-c".into(), script.into()],
            env: Default::default(),
            cwd: None,
            policy: Default::default(),
            max_restarts: 0,
        }
    }

    /// A fake MCP server answering initialize (id 1) and one follow-up
    /// request (id 2).  Request ids are deterministic: the counter starts
    /// at 1.
    const SCRIPTED_SERVER: &str = r#"
read line; printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}\n'
read line
read line; printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"echoes","inputSchema":{"type":"object"}}]}}\n'
"#;

    #[tokio::test]
    async fn initialize_marks_ready() {
        let proc = McpProcess::spawn("t", &config(SCRIPTED_SERVER)).unwrap();
        assert!(!proc.is_ready());
        proc.initialize(Duration::from_secs(2)).await.unwrap();
        assert!(proc.is_ready());
    }

    #[tokio::test]
    async fn request_correlates_by_id() {
        let proc = McpProcess::spawn("t", &config(SCRIPTED_SERVER)).unwrap();
        proc.initialize(Duration::from_secs(2)).await.unwrap();
        let result = proc
            .request("tools/list", json!({}), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        // A server that reads forever and never replies.
        let proc = McpProcess::spawn("slow", &config("while read line; do :; done")).unwrap();
        let err = proc
            .request("initialize", json!({}), Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout(_)));
        assert_eq!(err.to_string(), "MCP request timeout for slow");
        // The timed-out id is no longer pending.
        assert!(proc.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_exit_fails_outstanding_waiters() {
        // Server exits immediately; the pending request resolves ServerDown.
        let proc = McpProcess::spawn("gone", &config("exit 0")).unwrap();
        let err = proc
            .request("initialize", json!({}), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerDown(_)));
    }

    #[tokio::test]
    async fn json_rpc_error_maps_to_protocol_error() {
        let script = r#"read line; printf '{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}\n'"#;
        let proc = McpProcess::spawn("err", &config(script)).unwrap();
        let err = proc
            .request("nope", json!({}), Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            McpError::Protocol { message, .. } => assert!(message.contains("method not found")),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exit_signal_fires_when_child_dies() {
        let proc = McpProcess::spawn("bye", &config("exit 0")).unwrap();
        let exit = proc.take_exit_signal().unwrap();
        tokio::time::timeout(Duration::from_secs(2), exit)
            .await
            .expect("exit signal within 2s")
            .expect("exit sender not dropped");
    }

    #[tokio::test]
    async fn kill_terminates_a_stuck_server() {
        let proc = McpProcess::spawn("stuck", &config("while read line; do :; done")).unwrap();
        let exit = proc.take_exit_signal().unwrap();
        proc.kill();
        tokio::time::timeout(Duration::from_secs(2), exit)
            .await
            .expect("killed within 2s")
            .expect("exit sender not dropped");
    }
}
