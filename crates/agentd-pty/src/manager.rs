// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! PTY session table and stream fan-out.
//!
//! Each session gets a blocking reader thread feeding decoded chunks into a
//! tokio task that appends to the scrollback ring and reports output on the
//! manager's event channel.  A single poller task walks every subscriber
//! cursor on a fixed interval and pushes new content to that subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agentd_config::PtyConfig;

use crate::error::PtyError;
use crate::keys::key_sequence;
use crate::session::{ExitInfo, PtySession, ReadRequest, ReadResult};

/// Events reported by the manager to the kernel.
#[derive(Debug, Clone)]
pub enum PtyEvent {
    Opened {
        pty_id: String,
        owner_session: String,
    },
    /// Raw output appended to a session's scrollback.
    Output { pty_id: String, content: String },
    /// New content for one attached subscriber, pushed by the poller.
    SubscriberOutput {
        pty_id: String,
        subscriber: String,
        content: String,
        last_line: u64,
    },
    Closed {
        pty_id: String,
        exit_code: Option<u32>,
        signal: Option<i32>,
    },
}

/// Options for creating a PTY session.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: Option<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub shell: Option<String>,
    /// Written to the shell (with a trailing `\r`) right after spawn.
    pub initial_commands: Option<String>,
}

pub struct PtyManager {
    config: PtyConfig,
    sessions: DashMap<String, Arc<PtySession>>,
    events: mpsc::UnboundedSender<PtyEvent>,
}

impl PtyManager {
    pub fn new(config: PtyConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<PtyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            config,
            sessions: DashMap::new(),
            events: tx,
        });
        manager.spawn_poller();
        (manager, rx)
    }

    fn default_shell(&self) -> String {
        self.config
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/bash".to_string())
    }

    /// Spawn a shell in a fresh PTY and register the session.
    pub fn create(
        &self,
        owner_session: &str,
        opts: CreateOptions,
    ) -> Result<String, PtyError> {
        let shell = opts.shell.unwrap_or_else(|| self.default_shell());
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell);
        if let Some(cwd) = &opts.cwd {
            cmd.cwd(cwd);
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        drop(pair.slave);

        let killer = child.clone_killer();
        let pid = child.process_id();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let pty_id = Uuid::new_v4().to_string();
        let session = Arc::new(PtySession::new(
            pty_id.clone(),
            owner_session.to_string(),
            opts.name,
            shell,
            pair.master,
            writer,
            killer,
            pid,
            self.config.scrollback_lines,
        ));
        self.sessions.insert(pty_id.clone(), Arc::clone(&session));

        // Blocking reader thread → chunk channel.  An unbounded sender is
        // usable from a plain thread without an async context.
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match std::io::Read::read(&mut reader, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if chunk_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Chunk consumer: scrollback append + output event.
        {
            let session = Arc::clone(&session);
            let events = self.events.clone();
            tokio::spawn(async move {
                while let Some(chunk) = chunk_rx.recv().await {
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    session
                        .scrollback
                        .lock()
                        .expect("scrollback poisoned")
                        .push_chunk(&text);
                    let _ = events.send(PtyEvent::Output {
                        pty_id: session.id.clone(),
                        content: text,
                    });
                }
            });
        }

        // Wait thread: reap the shell and report the close.
        {
            let session = Arc::clone(&session);
            let events = self.events.clone();
            std::thread::spawn(move || {
                let info = match child.wait() {
                    Ok(status) => {
                        let code = status.exit_code();
                        // Exit codes above 128 follow the shell convention
                        // for signal deaths.
                        let signal = if code > 128 { Some((code - 128) as i32) } else { None };
                        ExitInfo {
                            exit_code: Some(code),
                            signal,
                        }
                    }
                    Err(_) => ExitInfo {
                        exit_code: None,
                        signal: None,
                    },
                };
                session.mark_closed(info);
                let _ = events.send(PtyEvent::Closed {
                    pty_id: session.id.clone(),
                    exit_code: info.exit_code,
                    signal: info.signal,
                });
            });
        }

        if let Some(initial) = &opts.initial_commands {
            let mut bytes = initial.clone().into_bytes();
            bytes.push(b'\r');
            session.write(&bytes)?;
        }

        let _ = self.events.send(PtyEvent::Opened {
            pty_id: pty_id.clone(),
            owner_session: owner_session.to_string(),
        });
        info!(pty = %pty_id, owner = %owner_session, "pty session created");
        Ok(pty_id)
    }

    pub fn get(&self, pty_id: &str) -> Result<Arc<PtySession>, PtyError> {
        self.sessions
            .get(pty_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| PtyError::NotFound(pty_id.to_string()))
    }

    pub fn write(&self, pty_id: &str, bytes: &[u8]) -> Result<(), PtyError> {
        self.get(pty_id)?.write(bytes)
    }

    /// Write a named special key (`ENTER`, `CTRL_C`, …).
    pub fn write_key(&self, pty_id: &str, key: &str) -> Result<(), PtyError> {
        let seq = key_sequence(key).ok_or_else(|| PtyError::UnknownKey(key.to_string()))?;
        self.write(pty_id, seq)
    }

    pub fn read(&self, pty_id: &str, req: &ReadRequest) -> Result<ReadResult, PtyError> {
        Ok(self.get(pty_id)?.read(req))
    }

    pub fn attach(&self, pty_id: &str, subscriber: &str) -> Result<(), PtyError> {
        self.get(pty_id)?.attach_subscriber(subscriber);
        Ok(())
    }

    pub fn detach(&self, pty_id: &str, subscriber: &str) -> Result<(), PtyError> {
        self.get(pty_id)?.detach_subscriber(subscriber);
        Ok(())
    }

    /// Close a session: SIGTERM, then — when `force` — SIGKILL after a
    /// short grace.  Scrollback is dropped when the session is removed.
    pub async fn close(&self, pty_id: &str, force: bool) -> Result<(), PtyError> {
        let session = self.get(pty_id)?;
        if !session.is_closed() {
            session.terminate();
            if force {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if !session.is_closed() {
                    session.kill();
                }
            }
        }
        self.sessions.remove(pty_id);
        Ok(())
    }

    /// Close every PTY owned by a terminated agent session.
    pub async fn close_for_owner(&self, owner_session: &str) {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().owner_session == owner_session)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            if let Err(e) = self.close(&id, true).await {
                warn!(pty = %id, error = %e, "failed to close pty");
            }
        }
    }

    /// Force-close everything; used at daemon shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.close(&id, true).await {
                warn!(pty = %id, error = %e, "failed to close pty");
            }
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Subscriber cursor poller (~100 ms): pushes new content to each
    /// attached subscriber through the event channel.
    fn spawn_poller(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let poll = Duration::from_millis(self.config.poll_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                for entry in manager.sessions.iter() {
                    let session = entry.value();
                    let subscribers: Vec<String> = session
                        .cursors
                        .lock()
                        .expect("cursors poisoned")
                        .keys()
                        .cloned()
                        .collect();
                    for subscriber in subscribers {
                        let result = session.read(&ReadRequest {
                            lines: None,
                            since_last_read: true,
                            subscriber: Some(subscriber.clone()),
                        });
                        if result.lines_read > 0 {
                            debug!(pty = %session.id, %subscriber, lines = result.lines_read, "pushing pty output");
                            let _ = manager.events.send(PtyEvent::SubscriberOutput {
                                pty_id: session.id.clone(),
                                subscriber,
                                content: result.content,
                                last_line: result.last_read_line,
                            });
                        }
                    }
                }
            }
        });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
