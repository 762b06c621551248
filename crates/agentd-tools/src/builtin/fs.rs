// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolContext, ToolOutput};

/// Byte cap on file content returned to the model.
const READ_LIMIT_BYTES: usize = 64 * 1024;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file. Content larger than 64 KB is truncated."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to read" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> ToolOutput {
        let Some(path) = args.get("path").and_then(Value::as_str) else {
            return ToolOutput::err("missing required parameter 'path'");
        };
        debug!(path, "read_file tool");
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let truncated = bytes.len() > READ_LIMIT_BYTES;
                let slice = &bytes[..bytes.len().min(READ_LIMIT_BYTES)];
                let mut content = String::from_utf8_lossy(slice).into_owned();
                if truncated {
                    content.push_str("\n...[truncated]");
                }
                ToolOutput::ok(content).with_metadata(json!({"bytes": bytes.len()}))
            }
            Err(e) => ToolOutput::err(format!("cannot read {path}: {e}")),
        }
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, replacing it if it exists. Parent \
         directories are created."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to write" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn requires_human_approval(&self) -> bool {
        true
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> ToolOutput {
        let Some(path) = args.get("path").and_then(Value::as_str) else {
            return ToolOutput::err("missing required parameter 'path'");
        };
        let Some(content) = args.get("content").and_then(Value::as_str) else {
            return ToolOutput::err("missing required parameter 'content'");
        };
        if let Some(parent) = std::path::Path::new(path).parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(format!("cannot create {}: {e}", parent.display()));
            }
        }
        match tokio::fs::write(path, content).await {
            Ok(()) => ToolOutput::ok(format!("wrote {} bytes to {path}", content.len())),
            Err(e) => ToolOutput::err(format!("cannot write {path}: {e}")),
        }
    }
}

pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List directory entries, directories first with a trailing slash."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: cwd)" }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> ToolOutput {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(".")
            .to_string();
        debug!(path = %path, "list_directory tool");

        let mut rd = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) => return ToolOutput::err(format!("cannot access {path}: {e}")),
        };

        let mut entries: Vec<(String, bool)> = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push((name, is_dir));
        }
        entries.sort_by(|(a, a_dir), (b, b_dir)| b_dir.cmp(a_dir).then(a.cmp(b)));

        if entries.is_empty() {
            return ToolOutput::ok("(empty directory)");
        }
        let listing: Vec<String> = entries
            .into_iter()
            .map(|(name, is_dir)| if is_dir { format!("{name}/") } else { name })
            .collect();
        ToolOutput::ok(listing.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
