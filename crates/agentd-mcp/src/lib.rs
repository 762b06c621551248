// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cache;
mod error;
mod process;
mod supervisor;
mod tools;

pub use cache::{RemoteToolSpec, SchemaCache};
pub use error::McpError;
pub use process::{McpProcess, PROTOCOL_VERSION};
pub use supervisor::{McpServer, McpSupervisor, McpTimeouts};
pub use tools::{register_remote_tools, McpRemoteTool};
