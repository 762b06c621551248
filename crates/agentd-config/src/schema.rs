// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_tick_ms() -> u64 {
    100
}

fn default_scrollback() -> usize {
    10_000
}

fn default_poll_ms() -> u64 {
    100
}

fn default_shell_timeout() -> u64 {
    30
}

fn default_max_restarts() -> u32 {
    3
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub pty: PtyConfig,
    /// MCP tool servers keyed by name.
    ///
    /// ```yaml
    /// mcp:
    ///   files:
    ///     command: npx
    ///     args: ["-y", "@modelcontextprotocol/server-filesystem", "/data"]
    ///     policy: approve
    /// ```
    #[serde(default)]
    pub mcp: HashMap<String, McpServerConfig>,
    /// Workspace root holding `agents/` and the allowlist.
    /// `~` is expanded.  Defaults to `~/.agentd`.
    #[serde(default)]
    pub workspace: Option<String>,
}

/// Default model selection forwarded to the provider router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier.  A `prefix:` selects a provider explicitly
    /// (e.g. `ollama:qwen3:8b`); bare names are matched by provider regex.
    pub name: String,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "mock:echo".into(),
            max_tokens: Some(4096),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scheduler tick interval in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Reject FSM transitions that are not in the table.  When `false` the
    /// engine logs a warning and applies the transition anyway.
    #[serde(default)]
    pub strict_transitions: bool,
    /// Default wall-clock timeout for new sessions, in seconds.
    /// `None` means sessions run until a terminal state.
    pub session_timeout_secs: Option<u64>,
    /// Seconds before an unanswered approval request expires.
    pub approval_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            strict_transitions: false,
            session_timeout_secs: None,
            approval_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Shell command timeout in seconds.
    #[serde(default = "default_shell_timeout")]
    pub shell_timeout_secs: u64,
    /// Path to the allowlist rules file.  Relative paths resolve against
    /// the workspace root.  Defaults to `allowlist.yaml`.
    #[serde(default)]
    pub allowlist_file: Option<String>,
    /// Register the built-in file tools (read_file, write_file,
    /// list_directory) in addition to execute_shell.
    #[serde(default = "default_true")]
    pub builtin_file_tools: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell_timeout_secs: default_shell_timeout(),
            allowlist_file: None,
            builtin_file_tools: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyConfig {
    /// Scrollback capacity in lines per PTY session.
    #[serde(default = "default_scrollback")]
    pub scrollback_lines: usize,
    /// Subscriber poll interval in milliseconds.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// Shell binary for new PTY sessions.  Defaults to `$SHELL` or
    /// `/bin/bash`.
    pub shell: Option<String>,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            scrollback_lines: default_scrollback(),
            poll_ms: default_poll_ms(),
            shell: None,
        }
    }
}

/// Approval policy applied to every tool exposed by an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpPolicy {
    /// Run without asking.
    Allow,
    /// Ask the operator before each invocation.
    #[default]
    Approve,
    /// Never run; calls fail with a policy error.
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Executable to spawn.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment merged over the daemon's environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child.  Defaults to the daemon's cwd.
    pub cwd: Option<String>,
    #[serde(default)]
    pub policy: McpPolicy,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_complete() {
        let cfg = Config::default();
        assert_eq!(cfg.engine.tick_ms, 100);
        assert_eq!(cfg.pty.scrollback_lines, 10_000);
        assert_eq!(cfg.tools.shell_timeout_secs, 30);
        assert!(cfg.mcp.is_empty());
    }

    #[test]
    fn strict_transitions_default_off() {
        assert!(!EngineConfig::default().strict_transitions);
    }

    #[test]
    fn mcp_policy_default_is_approve() {
        assert_eq!(McpPolicy::default(), McpPolicy::Approve);
    }

    #[test]
    fn mcp_server_deserializes_with_minimal_fields() {
        let yaml = "command: npx\nargs: [\"-y\", \"server\"]\n";
        let cfg: McpServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.command, "npx");
        assert_eq!(cfg.policy, McpPolicy::Approve);
        assert_eq!(cfg.max_restarts, 3);
        assert!(cfg.env.is_empty());
    }

    #[test]
    fn mcp_policy_parses_lowercase() {
        let p: McpPolicy = serde_yaml::from_str("deny").unwrap();
        assert_eq!(p, McpPolicy::Deny);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let cfg = Config::default();
        let text = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.engine.tick_ms, cfg.engine.tick_ms);
        assert_eq!(back.model.name, cfg.model.name);
    }
}
