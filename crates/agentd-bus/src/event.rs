// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything observable that the kernel reports to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "session:started")]
    SessionStarted,
    #[serde(rename = "session:forked")]
    SessionForked,
    #[serde(rename = "session:updated")]
    SessionUpdated,
    #[serde(rename = "state:changed")]
    StateChanged,
    #[serde(rename = "message:added")]
    MessageAdded,
    #[serde(rename = "tool:call")]
    ToolCall,
    #[serde(rename = "tool:result")]
    ToolResult,
    #[serde(rename = "approval:requested")]
    ApprovalRequested,
    #[serde(rename = "approval:resolved")]
    ApprovalResolved,
    #[serde(rename = "approval:denied")]
    ApprovalDenied,
    #[serde(rename = "channel:created")]
    ChannelCreated,
    #[serde(rename = "channel:deleted")]
    ChannelDeleted,
    #[serde(rename = "channel:joined")]
    ChannelJoined,
    #[serde(rename = "channel:left")]
    ChannelLeft,
    #[serde(rename = "pty:opened")]
    PtyOpened,
    #[serde(rename = "pty:output")]
    PtyOutput,
    #[serde(rename = "pty:closed")]
    PtyClosed,
    #[serde(rename = "daemon:shutdown")]
    DaemonShutdown,
}

impl EventKind {
    /// The wire name (`state:changed` etc.).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "session:started",
            Self::SessionForked => "session:forked",
            Self::SessionUpdated => "session:updated",
            Self::StateChanged => "state:changed",
            Self::MessageAdded => "message:added",
            Self::ToolCall => "tool:call",
            Self::ToolResult => "tool:result",
            Self::ApprovalRequested => "approval:requested",
            Self::ApprovalResolved => "approval:resolved",
            Self::ApprovalDenied => "approval:denied",
            Self::ChannelCreated => "channel:created",
            Self::ChannelDeleted => "channel:deleted",
            Self::ChannelJoined => "channel:joined",
            Self::ChannelLeft => "channel:left",
            Self::PtyOpened => "pty:opened",
            Self::PtyOutput => "pty:output",
            Self::PtyClosed => "pty:closed",
            Self::DaemonShutdown => "daemon:shutdown",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed record of something observable.
///
/// `seq` is monotonic within the event's session (daemon-wide for events
/// with no session), so a single observer can order a session's events even
/// after reconnecting from the replay buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_with_colon_names() {
        let s = serde_json::to_string(&EventKind::StateChanged).unwrap();
        assert_eq!(s, "\"state:changed\"");
    }

    #[test]
    fn as_str_matches_serde_name() {
        for kind in [
            EventKind::SessionStarted,
            EventKind::StateChanged,
            EventKind::PtyOutput,
            EventKind::DaemonShutdown,
        ] {
            let via_serde = serde_json::to_string(&kind).unwrap();
            assert_eq!(via_serde, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn event_json_shape() {
        let ev = Event {
            kind: EventKind::ToolCall,
            session_id: Some("3".into()),
            channel: None,
            seq: 7,
            timestamp: Utc::now(),
            data: serde_json::json!({"tool": "execute_shell"}),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tool:call");
        assert_eq!(v["session_id"], "3");
        assert_eq!(v["seq"], 7);
        assert!(v.get("channel").is_none());
    }
}
