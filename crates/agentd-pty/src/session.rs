// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use portable_pty::{ChildKiller, MasterPty};
use tracing::debug;

use crate::error::PtyError;
use crate::scrollback::Scrollback;

/// Exit information recorded when the shell terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: Option<u32>,
    pub signal: Option<i32>,
}

/// Options for reading scrollback.
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    /// Return the last N lines.  Default 100.
    pub lines: Option<usize>,
    /// Return content after the subscriber's cursor instead, advancing it.
    pub since_last_read: bool,
    /// Cursor identity for `since_last_read`; defaults to `"default"`.
    pub subscriber: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReadResult {
    pub content: String,
    pub lines_read: usize,
    pub total_lines: u64,
    pub last_read_line: u64,
}

/// One live pseudo-terminal process plus its scrollback.
pub struct PtySession {
    pub id: String,
    pub owner_session: String,
    pub name: Option<String>,
    pub shell: String,
    /// Keeps the PTY open; dropping the master hangs up the slave side.
    _master: StdMutex<Box<dyn MasterPty + Send>>,
    writer: StdMutex<Box<dyn Write + Send>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    pub(crate) scrollback: StdMutex<Scrollback>,
    /// Per-subscriber read cursors (complete-line counts).  Non-durable.
    pub(crate) cursors: StdMutex<HashMap<String, u64>>,
    closed: AtomicBool,
    exit: StdMutex<Option<ExitInfo>>,
}

impl PtySession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        owner_session: String,
        name: Option<String>,
        shell: String,
        master: Box<dyn MasterPty + Send>,
        writer: Box<dyn Write + Send>,
        killer: Box<dyn ChildKiller + Send + Sync>,
        pid: Option<u32>,
        scrollback_capacity: usize,
    ) -> Self {
        Self {
            id,
            owner_session,
            name,
            shell,
            _master: StdMutex::new(master),
            writer: StdMutex::new(writer),
            killer: StdMutex::new(killer),
            pid,
            scrollback: StdMutex::new(Scrollback::new(scrollback_capacity)),
            cursors: StdMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            exit: StdMutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.lock().expect("exit slot poisoned")
    }

    pub(crate) fn mark_closed(&self, info: ExitInfo) {
        *self.exit.lock().expect("exit slot poisoned") = Some(info);
        self.closed.store(true, Ordering::Release);
    }

    /// Append bytes to the shell's stdin.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        if self.is_closed() {
            return Err(PtyError::Closed(self.id.clone()));
        }
        let mut writer = self.writer.lock().expect("pty writer poisoned");
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Read scrollback, either the last N lines or since the subscriber's
    /// cursor.  The partial line (usually the prompt) is always appended so
    /// callers see the live edge of the terminal.
    pub fn read(&self, req: &ReadRequest) -> ReadResult {
        let sb = self.scrollback.lock().expect("scrollback poisoned");
        let total = sb.total_lines();

        let (lines, last_read_line) = if req.since_last_read {
            let subscriber = req.subscriber.as_deref().unwrap_or("default").to_string();
            let mut cursors = self.cursors.lock().expect("cursors poisoned");
            let cursor = cursors.get(&subscriber).copied().unwrap_or(0);
            let (lines, new_cursor) = sb.since(cursor);
            cursors.insert(subscriber, new_cursor);
            (lines, new_cursor)
        } else {
            (sb.last_n(req.lines.unwrap_or(100)), total)
        };

        let mut content = lines.join("\n");
        if !sb.partial().is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(sb.partial());
        }
        ReadResult {
            content,
            lines_read: lines.len(),
            total_lines: total,
            last_read_line,
        }
    }

    /// Register a subscriber cursor starting at the current tail.
    pub fn attach_subscriber(&self, subscriber: &str) {
        let total = self
            .scrollback
            .lock()
            .expect("scrollback poisoned")
            .total_lines();
        self.cursors
            .lock()
            .expect("cursors poisoned")
            .entry(subscriber.to_string())
            .or_insert(total);
    }

    pub fn detach_subscriber(&self, subscriber: &str) {
        self.cursors
            .lock()
            .expect("cursors poisoned")
            .remove(subscriber);
    }

    /// Graceful stop: SIGTERM the shell.  With `force`, SIGKILL follows
    /// after a short grace (handled by the manager's close path).
    pub fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            debug!(pty = %self.id, pid, "sent SIGTERM");
            return;
        }
        self.kill();
    }

    /// SIGKILL the shell.
    pub fn kill(&self) {
        let _ = self
            .killer
            .lock()
            .expect("killer poisoned")
            .kill();
        debug!(pty = %self.id, "killed");
    }
}
