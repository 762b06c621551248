// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod approvals;
mod context;
mod dispatcher;
mod engine;
mod fsm;
#[cfg(test)]
mod tests;

pub use approvals::{ApprovalQueue, ApprovalRequest, ApprovalStatus, Resolution};
pub use context::KernelContext;
pub use dispatcher::{dispatch, DispatchOutcome};
pub use engine::{Engine, EngineCommand, EngineHandle};
pub use fsm::{can_transition, check_transition, FsmError, SessionState, TransitionMode};
