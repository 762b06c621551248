// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// A request went unanswered.  Does not count as a crash: the server is
    /// left running and `restart_count` is untouched.
    #[error("MCP request timeout for {0}")]
    Timeout(String),

    /// The server process is gone and will not be restarted.
    #[error("MCP server {0} is down")]
    ServerDown(String),

    /// The server answered with a JSON-RPC error or malformed frame.
    #[error("MCP protocol error from {server}: {message}")]
    Protocol { server: String, message: String },

    #[error("MCP server {0} is not configured")]
    NotConfigured(String),

    #[error("failed to spawn MCP server {server}: {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
