// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod mock;
mod provider;
mod types;

pub use mock::{MockProvider, ScriptTurn, ScriptedProvider};
pub use provider::{LlmProvider, ProviderError, ProviderRegistry};
pub use types::{
    to_wire_messages, ChatCompletion, Choice, CompletionMessage, CompletionRequest, Message, Role,
    ToolCall, ToolSchema, Usage, WireMessage,
};
