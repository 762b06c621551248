// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Translation of remote MCP tools into registry entries.
//!
//! Each remote tool `{name, description, inputSchema}` becomes a registry
//! entry named `mcp_<server>_<name>` whose execute sends `tools/call` and
//! unwraps the result.  The server's configured policy
//! (`allow | approve | deny`) is applied as the tool's pre-use default.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use agentd_config::McpPolicy;
use agentd_tools::{PreUseDecision, Tool, ToolContext, ToolOutput, ToolRegistry};

use crate::cache::RemoteToolSpec;
use crate::supervisor::McpSupervisor;

pub struct McpRemoteTool {
    supervisor: Arc<McpSupervisor>,
    server: String,
    remote_name: String,
    registry_name: String,
    description: String,
    input_schema: Value,
    policy: McpPolicy,
}

impl McpRemoteTool {
    pub fn new(supervisor: Arc<McpSupervisor>, server: &str, spec: &RemoteToolSpec) -> Self {
        let policy = supervisor
            .server(server)
            .map(|s| s.config.policy)
            .unwrap_or_default();
        Self {
            supervisor,
            server: server.to_string(),
            remote_name: spec.name.clone(),
            registry_name: format!("mcp_{}_{}", server, spec.name),
            description: spec.description.clone(),
            input_schema: spec.input_schema.clone(),
            policy,
        }
    }
}

#[async_trait]
impl Tool for McpRemoteTool {
    fn name(&self) -> &str {
        &self.registry_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.input_schema.clone()
    }

    fn pre_use(&self, _args: &Value, ctx: &ToolContext) -> PreUseDecision {
        match self.policy {
            McpPolicy::Allow => PreUseDecision::Allow,
            McpPolicy::Approve => {
                if ctx.approval_grant {
                    PreUseDecision::Allow
                } else {
                    PreUseDecision::Approve
                }
            }
            McpPolicy::Deny => PreUseDecision::Deny(format!(
                "denied by policy for MCP server {}",
                self.server
            )),
        }
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> ToolOutput {
        match self
            .supervisor
            .call_tool(&self.server, &self.remote_name, args.clone())
            .await
        {
            Ok(result) => {
                let is_error = result
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let content = result
                    .get("content")
                    .and_then(Value::as_array)
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p.get("text").and_then(Value::as_str))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                ToolOutput {
                    success: !is_error,
                    content,
                    metadata: result,
                }
            }
            Err(e) => ToolOutput::err(e.to_string()),
        }
    }
}

/// Register every known remote tool of every configured server.
pub fn register_remote_tools(registry: &mut ToolRegistry, supervisor: &Arc<McpSupervisor>) {
    for server_name in supervisor.server_names() {
        if let Some(server) = supervisor.server(&server_name) {
            for spec in server.tools() {
                registry.register(McpRemoteTool::new(
                    Arc::clone(supervisor),
                    &server_name,
                    &spec,
                ));
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
