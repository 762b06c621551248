// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod error;
mod keys;
mod manager;
mod scrollback;
mod session;
mod tools;

pub use error::PtyError;
pub use keys::key_sequence;
pub use manager::{CreateOptions, PtyEvent, PtyManager};
pub use scrollback::Scrollback;
pub use session::{ExitInfo, PtySession, ReadRequest, ReadResult};
pub use tools::{register_pty_tools, PtyCloseTool, PtyCreateTool, PtyReadTool, PtyWriteTool};
