// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Exit codes shared by every subcommand.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const SESSION_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const TIMEOUT: i32 = 3;
}

#[derive(Parser, Debug)]
#[command(
    name = "agentd",
    about = "Local multi-agent orchestration daemon",
    version
)]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (otherwise only AGENTD_LOG_FILE receives output).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon: FSM engine, MCP fleet, PTY manager, event bus.
    ///
    /// Runs until interrupted.  On SIGINT/SIGTERM all PTY sessions are
    /// force-closed, MCP servers receive a shutdown RPC then SIGTERM, and a
    /// daemon:shutdown event is broadcast before exit.
    Run,

    /// Create a session from a template and run it to completion.
    New {
        /// Template name under agents/templates/.
        template: String,
        /// Initial user prompt.  Without one the session is created idle.
        prompt: Option<String>,
        /// Fail when another session of the same template is still active.
        #[arg(long)]
        lock: bool,
        /// Terminate existing active sessions of this template first.
        #[arg(long)]
        kill: bool,
        /// Wall-clock timeout in seconds for this session.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Fork an existing session into a fresh one and run it.
    Fork {
        session_id: String,
        prompt: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List persisted sessions with state and last-message preview.
    List,

    /// Append a user message to a session (re-queues terminal sessions).
    Push { session_id: String, prompt: String },

    /// Stop a session and mark it stopped.
    Kill { session_id: String },

    /// Follow a session's log, printing messages as they are appended.
    ///
    /// Uses the session's last-read cursor, so a second watcher continues
    /// where the previous one left off.
    Watch { session_id: String },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run() {
        let cli = Cli::try_parse_from(["agentd", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run));
    }

    #[test]
    fn parses_new_with_flags() {
        let cli = Cli::try_parse_from([
            "agentd", "new", "solo", "list files", "--lock", "--timeout", "90",
        ])
        .unwrap();
        match cli.command {
            Commands::New {
                template,
                prompt,
                lock,
                kill,
                timeout,
            } => {
                assert_eq!(template, "solo");
                assert_eq!(prompt.as_deref(), Some("list files"));
                assert!(lock);
                assert!(!kill);
                assert_eq!(timeout, Some(90));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["agentd", "list", "--config", "/tmp/c.yaml"]).unwrap();
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/tmp/c.yaml"))
        );
    }

    #[test]
    fn push_requires_prompt() {
        assert!(Cli::try_parse_from(["agentd", "push", "3"]).is_err());
        assert!(Cli::try_parse_from(["agentd", "push", "3", "hello"]).is_ok());
    }
}
