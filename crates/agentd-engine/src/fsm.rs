// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session lifecycle state machine.
//!
//! ```text
//! created      → pending
//! pending      → running | paused | stopped
//! running      → tool_exec | success | failed | paused | stopped
//! tool_exec    → running | human_input | paused | stopped | failed
//! human_input  → running | paused | stopped
//! paused       → pending | stopped
//! failed       → pending            (retry)
//! success, stopped : terminal
//! ```
//!
//! Strict mode rejects off-table edges; permissive mode logs a warning and
//! applies them anyway.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Pending,
    Running,
    ToolExec,
    HumanInput,
    Paused,
    Success,
    Failed,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ToolExec => "tool_exec",
            Self::HumanInput => "human_input",
            Self::Paused => "paused",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => Self::Created,
            "pending" => Self::Pending,
            "running" => Self::Running,
            "tool_exec" => Self::ToolExec,
            "human_input" => Self::HumanInput,
            "paused" => Self::Paused,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "stopped" => Self::Stopped,
            _ => return None,
        })
    }

    /// Terminal states never transition on their own; `failed` only leaves
    /// through an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionMode {
    /// Reject off-table transitions with [`FsmError::InvalidTransition`].
    Strict,
    /// Log a warning and apply the transition anyway.
    Permissive,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FsmError {
    #[error("invalid transition {from} → {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

/// The allowed-transition table.
pub fn can_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (Created, Pending)
            | (Pending, Running | Paused | Stopped)
            | (Running, ToolExec | Success | Failed | Paused | Stopped)
            | (ToolExec, Running | HumanInput | Paused | Stopped | Failed)
            | (HumanInput, Running | Paused | Stopped)
            | (Paused, Pending | Stopped)
            | (Failed, Pending)
    )
}

/// Validate a transition under the given mode.
pub fn check_transition(
    mode: TransitionMode,
    from: SessionState,
    to: SessionState,
) -> Result<(), FsmError> {
    if can_transition(from, to) {
        return Ok(());
    }
    match mode {
        TransitionMode::Strict => Err(FsmError::InvalidTransition { from, to }),
        TransitionMode::Permissive => {
            warn!(%from, %to, "applying off-table transition");
            Ok(())
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
