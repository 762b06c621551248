// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tool dispatch: policy hook → approval gate → execution → `tool` message.
//!
//! The dispatcher never lets a tool failure escape as an error: unknown
//! tools, policy denials, panics, and execution failures all become a
//! `tool` message with `success: false` so the conversation can continue.

use agentd_model::{Message, ToolCall};
use agentd_tools::{PreUseDecision, ToolContext};
use tracing::warn;

use crate::approvals::ApprovalRequest;
use crate::context::KernelContext;

/// What happened to one dispatched tool call.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The call ran (or was refused) and produced a `tool` message.
    Executed {
        message: Message,
        tool_name: String,
        success: bool,
        /// Set when the pre-use hook denied the call, so the engine fires
        /// `approval:denied` instead of a plain result event.
        policy_denied: bool,
    },
    /// The pre-use hook wants a human; the engine parks the session in
    /// `human_input` until the request resolves.
    NeedsApproval(ApprovalRequest),
}

/// Dispatch a single tool call for a session.
///
/// `granted` marks a call the operator already approved: the pre-use hook
/// is skipped (via `approval_grant`) so the call is not asked twice.
pub async fn dispatch(
    ctx: &KernelContext,
    session_id: &str,
    call: &ToolCall,
    granted: bool,
) -> DispatchOutcome {
    let Some(tool) = ctx.registry.get(&call.name) else {
        return DispatchOutcome::Executed {
            message: Message::tool_result(
                &call.id,
                format!("error: unknown_tool {:?}", call.name),
            ),
            tool_name: call.name.clone(),
            success: false,
            policy_denied: false,
        };
    };

    let tool_ctx = ToolContext {
        session_id: session_id.to_string(),
        approval_grant: granted,
    };

    match tool.pre_use(&call.arguments, &tool_ctx) {
        PreUseDecision::Deny(reason) => DispatchOutcome::Executed {
            message: Message::tool_result(&call.id, reason),
            tool_name: call.name.clone(),
            success: false,
            policy_denied: true,
        },
        PreUseDecision::Approve => {
            let prompt = tool.approval_prompt(&call.arguments);
            DispatchOutcome::NeedsApproval(ApprovalRequest::new(
                session_id,
                call.clone(),
                prompt,
            ))
        }
        PreUseDecision::Allow => {
            // Run in a task so a panicking tool is contained and converted
            // into a failed result.
            let args = call.arguments.clone();
            let handle =
                tokio::spawn(async move { tool.execute(&args, &tool_ctx).await });
            let output = match handle.await {
                Ok(output) => output,
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "tool task panicked");
                    agentd_tools::ToolOutput::err(format!("tool panicked: {e}"))
                }
            };
            DispatchOutcome::Executed {
                message: Message::tool_result(&call.id, output.content),
                tool_name: call.name.clone(),
                success: output.success,
                policy_denied: false,
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
