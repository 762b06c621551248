// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Channel documents under `agents/channels/<name>.yaml`.
//!
//! A channel is a named grouping of session IDs.  A session belongs to at
//! most one channel: adding it somewhere removes it everywhere else.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use agentd_config::WorkspacePaths;

use crate::atomic::write_atomic;
use crate::error::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDocument {
    pub metadata: ChannelMetadata,
    pub spec: ChannelSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSpec {
    #[serde(default)]
    pub agent_sessions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

pub struct ChannelStore {
    paths: WorkspacePaths,
}

impl ChannelStore {
    pub fn new(paths: WorkspacePaths) -> Self {
        Self { paths }
    }

    fn channel_path(&self, name: &str) -> PathBuf {
        self.paths.channels_dir().join(format!("{name}.yaml"))
    }

    pub fn create(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<ChannelDocument, StoreError> {
        let now = Utc::now();
        let doc = ChannelDocument {
            metadata: ChannelMetadata {
                name: name.to_string(),
                created_at: now,
                updated_at: now,
            },
            spec: ChannelSpec {
                agent_sessions: vec![],
                description: description.map(str::to_string),
                labels: None,
            },
        };
        self.save(&doc)?;
        debug!(channel = name, "channel created");
        Ok(doc)
    }

    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.channel_path(name);
        if !path.exists() {
            return Err(StoreError::ChannelNotFound(name.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<ChannelDocument, StoreError> {
        let path = self.channel_path(name);
        if !path.exists() {
            return Err(StoreError::ChannelNotFound(name.to_string()));
        }
        let text = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&text).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn save(&self, doc: &ChannelDocument) -> Result<(), StoreError> {
        let text = serde_yaml::to_string(doc)?;
        write_atomic(&self.channel_path(&doc.metadata.name), text.as_bytes())?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ChannelDocument>, StoreError> {
        let mut docs = Vec::new();
        for entry in std::fs::read_dir(self.paths.channels_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".yaml") {
                docs.push(self.load(stem)?);
            }
        }
        docs.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(docs)
    }

    /// Add a session to a channel, removing it from any other channel first
    /// so membership stays exclusive.
    pub fn add_session(&self, name: &str, session_id: &str) -> Result<(), StoreError> {
        for other in self.list()? {
            if other.metadata.name != name
                && other.spec.agent_sessions.iter().any(|s| s == session_id)
            {
                self.remove_session(&other.metadata.name, session_id)?;
            }
        }

        let mut doc = self.load(name)?;
        if !doc.spec.agent_sessions.iter().any(|s| s == session_id) {
            doc.spec.agent_sessions.push(session_id.to_string());
            doc.metadata.updated_at = Utc::now();
            self.save(&doc)?;
        }
        Ok(())
    }

    pub fn remove_session(&self, name: &str, session_id: &str) -> Result<(), StoreError> {
        let mut doc = self.load(name)?;
        let before = doc.spec.agent_sessions.len();
        doc.spec.agent_sessions.retain(|s| s != session_id);
        if doc.spec.agent_sessions.len() != before {
            doc.metadata.updated_at = Utc::now();
            self.save(&doc)?;
        }
        Ok(())
    }

    /// The channel a session currently belongs to, if any.
    pub fn channel_of(&self, session_id: &str) -> Result<Option<String>, StoreError> {
        for doc in self.list()? {
            if doc.spec.agent_sessions.iter().any(|s| s == session_id) {
                return Ok(Some(doc.metadata.name));
            }
        }
        Ok(None)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ChannelStore) {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::at(dir.path());
        paths.ensure_layout().unwrap();
        (dir, ChannelStore::new(paths))
    }

    #[test]
    fn create_and_load() {
        let (_dir, store) = store();
        store.create("ops", Some("operations room")).unwrap();
        let doc = store.load("ops").unwrap();
        assert_eq!(doc.metadata.name, "ops");
        assert_eq!(doc.spec.description.as_deref(), Some("operations room"));
        assert!(doc.spec.agent_sessions.is_empty());
    }

    #[test]
    fn load_missing_channel_is_error() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load("ghost"),
            Err(StoreError::ChannelNotFound(_))
        ));
    }

    #[test]
    fn add_and_remove_session() {
        let (_dir, store) = store();
        store.create("ops", None).unwrap();
        store.add_session("ops", "7").unwrap();
        assert_eq!(store.load("ops").unwrap().spec.agent_sessions, vec!["7"]);

        store.remove_session("ops", "7").unwrap();
        assert!(store.load("ops").unwrap().spec.agent_sessions.is_empty());
    }

    #[test]
    fn add_session_is_idempotent() {
        let (_dir, store) = store();
        store.create("ops", None).unwrap();
        store.add_session("ops", "7").unwrap();
        store.add_session("ops", "7").unwrap();
        assert_eq!(store.load("ops").unwrap().spec.agent_sessions.len(), 1);
    }

    #[test]
    fn session_belongs_to_at_most_one_channel() {
        let (_dir, store) = store();
        store.create("a", None).unwrap();
        store.create("b", None).unwrap();
        store.add_session("a", "3").unwrap();
        store.add_session("b", "3").unwrap();
        assert!(store.load("a").unwrap().spec.agent_sessions.is_empty());
        assert_eq!(store.load("b").unwrap().spec.agent_sessions, vec!["3"]);
        assert_eq!(store.channel_of("3").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn delete_channel() {
        let (_dir, store) = store();
        store.create("tmp", None).unwrap();
        store.delete("tmp").unwrap();
        assert!(store.load("tmp").is_err());
        assert!(store.delete("tmp").is_err());
    }

    #[test]
    fn list_is_sorted_by_name() {
        let (_dir, store) = store();
        store.create("zeta", None).unwrap();
        store.create("alpha", None).unwrap();
        let names: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|d| d.metadata.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
