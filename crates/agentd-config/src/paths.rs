// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! On-disk layout of the workspace root.
//!
//! ```text
//! <root>/
//!   agents/
//!     sessions/<id>.yaml     per-session documents
//!     channels/<name>.yaml   per-channel documents
//!     templates/<name>.yaml  agent templates
//!     proc/_next             next session ID (decimal)
//!     mcp/<server>.yaml      cached MCP tool schemas
//!   allowlist.yaml           shell policy rules
//!   config.yaml              daemon configuration
//! ```

use std::path::{Path, PathBuf};

/// Resolved filesystem layout for one workspace.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    /// Resolve a workspace root.  `configured` comes from the config file or
    /// CLI and may contain `~`; `None` falls back to `~/.agentd`.
    pub fn resolve(configured: Option<&str>) -> Self {
        let root = match configured {
            Some(raw) => PathBuf::from(shellexpand::tilde(raw).into_owned()),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".agentd"),
        };
        Self { root }
    }

    /// Construct from an explicit root, used by tests with a tempdir.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("agents/sessions")
    }

    pub fn channels_dir(&self) -> PathBuf {
        self.root.join("agents/channels")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("agents/templates")
    }

    pub fn id_counter_file(&self) -> PathBuf {
        self.root.join("agents/proc/_next")
    }

    pub fn mcp_cache_dir(&self) -> PathBuf {
        self.root.join("agents/mcp")
    }

    pub fn allowlist_file(&self) -> PathBuf {
        self.root.join("allowlist.yaml")
    }

    /// Create every directory of the layout.  Fails when the root is not
    /// writable — that is fatal at daemon startup.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::create_dir_all(self.channels_dir())?;
        std::fs::create_dir_all(self.templates_dir())?;
        std::fs::create_dir_all(self.mcp_cache_dir())?;
        std::fs::create_dir_all(self.root.join("agents/proc"))?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
