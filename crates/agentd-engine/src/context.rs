// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Explicit wiring of the kernel's components.
//!
//! Everything the engine, dispatcher, and gateway touch travels through one
//! [`KernelContext`] value — there is no module-level mutable state.

use std::sync::Arc;

use agentd_bus::EventBus;
use agentd_config::Config;
use agentd_mcp::McpSupervisor;
use agentd_model::ProviderRegistry;
use agentd_pty::PtyManager;
use agentd_store::{ChannelStore, SessionStore};
use agentd_tools::ToolRegistry;

use crate::approvals::ApprovalQueue;

#[derive(Clone)]
pub struct KernelContext {
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    pub channels: Arc<ChannelStore>,
    pub registry: Arc<ToolRegistry>,
    pub providers: Arc<ProviderRegistry>,
    pub mcp: Arc<McpSupervisor>,
    pub pty: Arc<PtyManager>,
    pub bus: Arc<EventBus>,
    pub approvals: Arc<ApprovalQueue>,
}
