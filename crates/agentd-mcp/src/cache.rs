// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! YAML cache of discovered tool schemas, one file per server under
//! `agents/mcp/<server>.yaml`.  A present cache lets the daemon register a
//! server's tools without starting it; the first call triggers the start.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A remote tool as discovered via `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCache {
    pub server: String,
    pub updated: DateTime<Utc>,
    pub tools: BTreeMap<String, RemoteToolSpec>,
}

impl SchemaCache {
    pub fn new(server: &str, tools: Vec<RemoteToolSpec>) -> Self {
        Self {
            server: server.to_string(),
            updated: Utc::now(),
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn path(dir: &Path, server: &str) -> PathBuf {
        dir.join(format!("{server}.yaml"))
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        let text = serde_yaml::to_string(self)?;
        std::fs::write(Self::path(dir, &self.server), text)?;
        Ok(())
    }

    pub fn load(dir: &Path, server: &str) -> Option<Self> {
        let text = std::fs::read_to_string(Self::path(dir, server)).ok()?;
        serde_yaml::from_str(&text).ok()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SchemaCache::new(
            "files",
            vec![RemoteToolSpec {
                name: "read".into(),
                description: "reads".into(),
                input_schema: json!({"type": "object"}),
            }],
        );
        cache.save(dir.path()).unwrap();

        let loaded = SchemaCache::load(dir.path(), "files").unwrap();
        assert_eq!(loaded.server, "files");
        assert_eq!(loaded.tools["read"].description, "reads");
    }

    #[test]
    fn missing_cache_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SchemaCache::load(dir.path(), "ghost").is_none());
    }

    #[test]
    fn parses_tools_list_result_field_names() {
        // `inputSchema` is the MCP wire name.
        let spec: RemoteToolSpec = serde_json::from_value(json!({
            "name": "grep",
            "description": "searches",
            "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
        }))
        .unwrap();
        assert_eq!(spec.input_schema["properties"]["q"]["type"], "string");
    }
}
