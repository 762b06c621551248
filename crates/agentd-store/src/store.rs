// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Durable per-session documents under `agents/sessions/<id>.yaml`.
//!
//! Saves are atomic (temp file + rename).  Mutating operations serialize on
//! a per-session async lock, so concurrent pushes order by lock acquisition;
//! plain reads observe the last committed document.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use agentd_config::WorkspacePaths;
use agentd_model::Message;

use crate::atomic::write_atomic;
use crate::document::{render_system_prompt, SessionDocument, SessionSummary};
use crate::error::StoreError;
use crate::ids::IdAllocator;

/// FSM states that an incoming user message must not reset: the session is
/// already driving a turn and will pick the message up on its own.
const ACTIVE_STATES: &[&str] = &["pending", "running", "tool_exec", "human_input"];

pub struct SessionStore {
    paths: WorkspacePaths,
    ids: IdAllocator,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionStore {
    /// Open the store, validating the ID counter.  A corrupt counter is
    /// fatal: the caller must abort startup.
    pub fn open(paths: WorkspacePaths) -> Result<Self, StoreError> {
        paths.ensure_layout()?;
        let ids = IdAllocator::new(paths.id_counter_file());
        ids.verify()?;
        Ok(Self {
            paths,
            ids,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    /// Atomically allocate the next session ID.
    pub fn allocate_id(&self) -> Result<String, StoreError> {
        self.ids.allocate()
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.paths.sessions_dir().join(format!("{id}.yaml"))
    }

    fn template_path(&self, name: &str) -> PathBuf {
        self.paths.templates_dir().join(format!("{name}.yaml"))
    }

    async fn lock(&self, id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().expect("session lock table poisoned");
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        mutex.lock_owned().await
    }

    // ── Templates ─────────────────────────────────────────────────────────────

    pub fn load_template(&self, name: &str) -> Result<SessionDocument, StoreError> {
        let path = self.template_path(name);
        if !path.exists() {
            return Err(StoreError::TemplateNotFound(name.to_string()));
        }
        let text = std::fs::read_to_string(&path)?;
        let doc: SessionDocument =
            serde_yaml::from_str(&text).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(doc)
    }

    pub fn save_template(&self, name: &str, doc: &SessionDocument) -> Result<(), StoreError> {
        let text = serde_yaml::to_string(doc)?;
        write_atomic(&self.template_path(name), text.as_bytes())?;
        Ok(())
    }

    pub fn delete_template(&self, name: &str) -> Result<(), StoreError> {
        let path = self.template_path(name);
        if !path.exists() {
            return Err(StoreError::TemplateNotFound(name.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    pub fn list_templates(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.paths.templates_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".yaml") {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    // ── Session lifecycle ─────────────────────────────────────────────────────

    /// Instantiate a template into a new session.  The system prompt has its
    /// operating-system variables rendered; with an initial prompt the
    /// session starts `pending`, otherwise `created`.
    pub async fn new_session(
        &self,
        template: &str,
        initial_prompt: Option<&str>,
    ) -> Result<String, StoreError> {
        let mut doc = self.load_template(template)?;
        doc.metadata.name = template.to_string();
        doc.metadata.created_at = Utc::now();
        if let Some(sp) = &doc.spec.system_prompt {
            doc.spec.system_prompt = Some(render_system_prompt(sp));
        }

        if let Some(prompt) = initial_prompt {
            doc.spec.messages.push(Message::user(prompt));
            doc.metadata.fsm_state = Some("pending".into());
        } else {
            doc.metadata.fsm_state = Some("created".into());
        }

        let id = self.allocate_id()?;
        self.save_unlocked(&id, &doc)?;
        debug!(session = %id, template, "session created");
        Ok(id)
    }

    /// Copy an existing session's document under a fresh ID.  Labels and the
    /// tool capability list come along with the copy.
    pub async fn fork(&self, id: &str, prompt: Option<&str>) -> Result<String, StoreError> {
        let mut doc = self.load(id)?;
        if !doc.is_valid_agent() {
            return Err(StoreError::Corrupt(format!(
                "session {id} is not a daemon/v1 Agent document"
            )));
        }
        doc.metadata.created_at = Utc::now();
        if let Some(prompt) = prompt {
            doc.spec.messages.push(Message::user(prompt));
            doc.metadata.fsm_state = Some("pending".into());
        }
        let new_id = self.allocate_id()?;
        self.save_unlocked(&new_id, &doc)?;
        debug!(session = %new_id, parent = %id, "session forked");
        Ok(new_id)
    }

    pub fn load(&self, id: &str) -> Result<SessionDocument, StoreError> {
        let path = self.session_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let text = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&text).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    pub async fn save(&self, id: &str, doc: &SessionDocument) -> Result<(), StoreError> {
        let _guard = self.lock(id).await;
        self.save_unlocked(id, doc)
    }

    fn save_unlocked(&self, id: &str, doc: &SessionDocument) -> Result<(), StoreError> {
        let text = serde_yaml::to_string(doc)?;
        write_atomic(&self.session_path(id), text.as_bytes())?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock(id).await;
        let path = self.session_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Append a user message.  An idle or terminal session moves to
    /// `pending`; an actively running one keeps its state.
    pub async fn push(&self, id: &str, prompt: &str) -> Result<(), StoreError> {
        let _guard = self.lock(id).await;
        let mut doc = self.load(id)?;
        doc.spec.messages.push(Message::user(prompt));
        let active = doc
            .metadata
            .fsm_state
            .as_deref()
            .is_some_and(|s| ACTIVE_STATES.contains(&s));
        if !active {
            doc.metadata.fsm_state = Some("pending".into());
        }
        self.save_unlocked(id, &doc)
    }

    /// Append an engine-produced message (assistant or tool) verbatim.
    pub async fn append_message(&self, id: &str, message: Message) -> Result<(), StoreError> {
        let _guard = self.lock(id).await;
        let mut doc = self.load(id)?;
        doc.spec.messages.push(message);
        self.save_unlocked(id, &doc)
    }

    pub fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut summaries = Vec::new();
        for id in self.session_ids()? {
            match self.load(&id) {
                Ok(doc) => summaries.push(SessionSummary {
                    id: id.clone(),
                    state: doc.metadata.fsm_state.clone().unwrap_or_default(),
                    name: doc.metadata.name.clone(),
                    model: doc.metadata.model.clone(),
                    last_message: doc.last_message_preview(),
                }),
                Err(e) => warn!(session = %id, error = %e, "skipping unreadable session"),
            }
        }
        Ok(summaries)
    }

    /// All persisted session IDs, numerically sorted.
    pub fn session_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(self.paths.sessions_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".yaml") {
                ids.push(stem.to_string());
            }
        }
        ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
        Ok(ids)
    }

    // ── Cursors & FSM projection ──────────────────────────────────────────────

    pub async fn update_last_read(
        &self,
        id: &str,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _guard = self.lock(id).await;
        let mut doc = self.load(id)?;
        doc.metadata.last_read = Some(ts);
        self.save_unlocked(id, &doc)
    }

    pub fn get_last_read(&self, id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.load(id)?.metadata.last_read)
    }

    /// Persist the FSM projection for crash recovery.
    pub async fn set_fsm_state(
        &self,
        id: &str,
        state: &str,
        state_data: Option<Value>,
    ) -> Result<(), StoreError> {
        let _guard = self.lock(id).await;
        let mut doc = self.load(id)?;
        doc.metadata.fsm_state = Some(state.to_string());
        doc.metadata.fsm_state_data = state_data;
        self.save_unlocked(id, &doc)
    }

    // ── Gateway message edits ─────────────────────────────────────────────────

    pub async fn edit_message(
        &self,
        id: &str,
        index: usize,
        content: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.lock(id).await;
        let mut doc = self.load(id)?;
        let msg = doc.spec.messages.get_mut(index).ok_or_else(|| {
            StoreError::MessageOutOfRange {
                session: id.to_string(),
                index,
            }
        })?;
        msg.content = content.to_string();
        self.save_unlocked(id, &doc)
    }

    pub async fn delete_message(&self, id: &str, index: usize) -> Result<(), StoreError> {
        let _guard = self.lock(id).await;
        let mut doc = self.load(id)?;
        if index >= doc.spec.messages.len() {
            return Err(StoreError::MessageOutOfRange {
                session: id.to_string(),
                index,
            });
        }
        doc.spec.messages.remove(index);
        self.save_unlocked(id, &doc)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{SessionMetadata, SessionSpec, API_VERSION, KIND_AGENT};

    fn template_doc(system_prompt: &str) -> SessionDocument {
        SessionDocument {
            api_version: API_VERSION.into(),
            kind: KIND_AGENT.into(),
            metadata: SessionMetadata {
                name: "solo".into(),
                model: "mock:echo".into(),
                created_at: Utc::now(),
                labels: None,
                tools: Some(vec!["execute_shell".into(), "list_directory".into()]),
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
                system_prompt: Some(system_prompt.to_string()),
                messages: vec![],
            },
        }
    }

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(WorkspacePaths::at(dir.path())).unwrap();
        store
            .save_template("solo", &template_doc("You run on {{os}}."))
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn new_session_with_prompt_starts_pending() {
        let (_dir, store) = store();
        let id = store.new_session("solo", Some("list files")).await.unwrap();
        let doc = store.load(&id).unwrap();
        assert_eq!(doc.metadata.fsm_state.as_deref(), Some("pending"));
        assert_eq!(doc.spec.messages.len(), 1);
        assert_eq!(doc.spec.messages[0].content, "list files");
    }

    #[tokio::test]
    async fn new_session_without_prompt_starts_created() {
        let (_dir, store) = store();
        let id = store.new_session("solo", None).await.unwrap();
        let doc = store.load(&id).unwrap();
        assert_eq!(doc.metadata.fsm_state.as_deref(), Some("created"));
        assert!(doc.spec.messages.is_empty());
    }

    #[tokio::test]
    async fn system_prompt_variables_are_rendered() {
        let (_dir, store) = store();
        let id = store.new_session("solo", None).await.unwrap();
        let doc = store.load(&id).unwrap();
        let sp = doc.spec.system_prompt.unwrap();
        assert!(!sp.contains("{{os}}"));
    }

    #[tokio::test]
    async fn ids_are_sequential_across_sessions() {
        let (_dir, store) = store();
        let a = store.new_session("solo", None).await.unwrap();
        let b = store.new_session("solo", None).await.unwrap();
        assert_eq!(a, "0");
        assert_eq!(b, "1");
    }

    #[tokio::test]
    async fn unknown_template_is_an_error() {
        let (_dir, store) = store();
        assert!(matches!(
            store.new_session("nope", None).await,
            Err(StoreError::TemplateNotFound(_))
        ));
    }

    #[tokio::test]
    async fn fork_copies_labels_and_tools() {
        let (_dir, store) = store();
        let id = store.new_session("solo", Some("hi")).await.unwrap();
        // Give the parent a label after creation.
        let mut doc = store.load(&id).unwrap();
        doc.metadata.labels = Some([("team".to_string(), "infra".to_string())].into());
        store.save(&id, &doc).await.unwrap();

        let forked = store.fork(&id, Some("continue")).await.unwrap();
        let fdoc = store.load(&forked).unwrap();
        assert_eq!(
            fdoc.metadata.labels.unwrap().get("team").map(String::as_str),
            Some("infra")
        );
        assert_eq!(fdoc.metadata.tools.unwrap().len(), 2);
        // Parent messages plus the new prompt.
        assert_eq!(fdoc.spec.messages.len(), 2);
    }

    #[tokio::test]
    async fn push_promotes_terminal_state_to_pending() {
        let (_dir, store) = store();
        let id = store.new_session("solo", Some("hi")).await.unwrap();
        store.set_fsm_state(&id, "success", None).await.unwrap();
        store.push(&id, "next question").await.unwrap();
        let doc = store.load(&id).unwrap();
        assert_eq!(doc.metadata.fsm_state.as_deref(), Some("pending"));
        assert_eq!(doc.spec.messages.len(), 2);
    }

    #[tokio::test]
    async fn push_does_not_touch_running_state() {
        let (_dir, store) = store();
        let id = store.new_session("solo", Some("hi")).await.unwrap();
        store.set_fsm_state(&id, "running", None).await.unwrap();
        store.push(&id, "while running").await.unwrap();
        let doc = store.load(&id).unwrap();
        assert_eq!(doc.metadata.fsm_state.as_deref(), Some("running"));
    }

    #[tokio::test]
    async fn save_load_round_trip_is_stable() {
        let (_dir, store) = store();
        let id = store.new_session("solo", Some("hi")).await.unwrap();
        let doc1 = store.load(&id).unwrap();
        store.save(&id, &doc1).await.unwrap();
        let doc2 = store.load(&id).unwrap();
        assert_eq!(
            serde_yaml::to_string(&doc1).unwrap(),
            serde_yaml::to_string(&doc2).unwrap()
        );
    }

    #[tokio::test]
    async fn list_reports_state_and_preview() {
        let (_dir, store) = store();
        let id = store.new_session("solo", Some("list files")).await.unwrap();
        let summaries = store.list().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, id);
        assert_eq!(summaries[0].state, "pending");
        assert_eq!(summaries[0].last_message.as_deref(), Some("list files"));
    }

    #[tokio::test]
    async fn last_read_cursor_round_trips() {
        let (_dir, store) = store();
        let id = store.new_session("solo", None).await.unwrap();
        assert!(store.get_last_read(&id).unwrap().is_none());
        let ts = Utc::now();
        store.update_last_read(&id, ts).await.unwrap();
        assert_eq!(store.get_last_read(&id).unwrap(), Some(ts));
    }

    #[tokio::test]
    async fn fsm_projection_persists_state_data() {
        let (_dir, store) = store();
        let id = store.new_session("solo", None).await.unwrap();
        store
            .set_fsm_state(&id, "failed", Some(serde_json::json!({"error": "boom"})))
            .await
            .unwrap();
        let doc = store.load(&id).unwrap();
        assert_eq!(doc.metadata.fsm_state.as_deref(), Some("failed"));
        assert_eq!(doc.metadata.fsm_state_data.unwrap()["error"], "boom");
    }

    #[tokio::test]
    async fn edit_and_delete_message() {
        let (_dir, store) = store();
        let id = store.new_session("solo", Some("original")).await.unwrap();
        store.edit_message(&id, 0, "edited").await.unwrap();
        assert_eq!(store.load(&id).unwrap().spec.messages[0].content, "edited");

        store.delete_message(&id, 0).await.unwrap();
        assert!(store.load(&id).unwrap().spec.messages.is_empty());

        assert!(matches!(
            store.delete_message(&id, 5).await,
            Err(StoreError::MessageOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn delete_session_removes_document() {
        let (_dir, store) = store();
        let id = store.new_session("solo", None).await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(matches!(store.load(&id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn open_fails_on_corrupt_counter() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::at(dir.path());
        paths.ensure_layout().unwrap();
        std::fs::write(paths.id_counter_file(), "garbage").unwrap();
        assert!(matches!(
            SessionStore::open(paths),
            Err(StoreError::CorruptCounter(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_pushes_serialize() {
        let (_dir, store) = store();
        let store = std::sync::Arc::new(store);
        let id = store.new_session("solo", None).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = std::sync::Arc::clone(&store);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                store.push(&id, &format!("msg {i}")).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let doc = store.load(&id).unwrap();
        assert_eq!(doc.spec.messages.len(), 8);
    }
}
