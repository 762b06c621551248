// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Outstanding human-approval requests.
//!
//! The gateway resolves entries via `tool:approve` / `tool:reject` /
//! `tool:reply`; the engine expires unanswered requests past their deadline
//! and lets the corresponding tool call fail with "denied (timeout)".

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agentd_model::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    pub tool_call: ToolCall,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

impl ApprovalRequest {
    pub fn new(session_id: &str, tool_call: ToolCall, prompt: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool_call,
            prompt,
            created_at: Utc::now(),
            status: ApprovalStatus::Pending,
        }
    }
}

/// How an entry was resolved, handed back to the engine.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub request: ApprovalRequest,
    pub approved: bool,
    /// Free-text operator reply (`tool:reply`); becomes the tool result.
    pub reply: Option<String>,
}

struct Entry {
    request: ApprovalRequest,
    deadline: Option<Instant>,
}

#[derive(Default)]
pub struct ApprovalQueue {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ApprovalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, request: ApprovalRequest, deadline: Option<Instant>) {
        self.entries
            .lock()
            .expect("approval queue poisoned")
            .insert(request.id.clone(), Entry { request, deadline });
    }

    /// Resolve an entry.  Returns `None` for an unknown or already-resolved
    /// id.
    pub fn resolve(
        &self,
        id: &str,
        approved: bool,
        reply: Option<String>,
    ) -> Option<Resolution> {
        let mut entries = self.entries.lock().expect("approval queue poisoned");
        let mut entry = entries.remove(id)?;
        entry.request.status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        Some(Resolution {
            request: entry.request,
            approved,
            reply,
        })
    }

    /// Remove and return every entry past its deadline, marked `expired`.
    pub fn expire_due(&self, now: Instant) -> Vec<ApprovalRequest> {
        let mut entries = self.entries.lock().expect("approval queue poisoned");
        let due: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();
        due.into_iter()
            .filter_map(|id| entries.remove(&id))
            .map(|mut e| {
                e.request.status = ApprovalStatus::Expired;
                e.request
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<ApprovalRequest> {
        self.entries
            .lock()
            .expect("approval queue poisoned")
            .get(id)
            .map(|e| e.request.clone())
    }

    /// All pending requests, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let entries = self.entries.lock().expect("approval queue poisoned");
        let mut all: Vec<ApprovalRequest> =
            entries.values().map(|e| e.request.clone()).collect();
        all.sort_by_key(|r| r.created_at);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("approval queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn request(session: &str) -> ApprovalRequest {
        ApprovalRequest::new(
            session,
            ToolCall {
                id: "call-1".into(),
                name: "execute_shell".into(),
                arguments: json!({"command": "make"}),
            },
            "Run shell command?".into(),
        )
    }

    #[test]
    fn enqueue_and_get() {
        let q = ApprovalQueue::new();
        let req = request("0");
        let id = req.id.clone();
        q.enqueue(req, None);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(&id).unwrap().status, ApprovalStatus::Pending);
    }

    #[test]
    fn approve_removes_and_marks() {
        let q = ApprovalQueue::new();
        let req = request("0");
        let id = req.id.clone();
        q.enqueue(req, None);

        let res = q.resolve(&id, true, None).unwrap();
        assert!(res.approved);
        assert_eq!(res.request.status, ApprovalStatus::Approved);
        assert!(q.is_empty());
        // Second resolve is a no-op.
        assert!(q.resolve(&id, true, None).is_none());
    }

    #[test]
    fn reject_carries_denied_status() {
        let q = ApprovalQueue::new();
        let req = request("0");
        let id = req.id.clone();
        q.enqueue(req, None);
        let res = q.resolve(&id, false, None).unwrap();
        assert!(!res.approved);
        assert_eq!(res.request.status, ApprovalStatus::Denied);
    }

    #[test]
    fn reply_is_forwarded() {
        let q = ApprovalQueue::new();
        let req = request("0");
        let id = req.id.clone();
        q.enqueue(req, None);
        let res = q.resolve(&id, true, Some("use the staging dir".into())).unwrap();
        assert_eq!(res.reply.as_deref(), Some("use the staging dir"));
    }

    #[test]
    fn expiry_only_affects_entries_past_deadline() {
        let q = ApprovalQueue::new();
        let now = Instant::now();

        let due = request("0");
        let due_id = due.id.clone();
        q.enqueue(due, Some(now - Duration::from_secs(1)));

        let later = request("1");
        let later_id = later.id.clone();
        q.enqueue(later, Some(now + Duration::from_secs(60)));

        let undated = request("2");
        q.enqueue(undated, None);

        let expired = q.expire_due(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, due_id);
        assert_eq!(expired[0].status, ApprovalStatus::Expired);
        assert!(q.get(&later_id).is_some());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn pending_is_ordered_oldest_first() {
        let q = ApprovalQueue::new();
        let a = request("0");
        let b = request("1");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        q.enqueue(a, None);
        q.enqueue(b, None);
        let ids: Vec<String> = q.pending().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a_id, b_id]);
    }
}
