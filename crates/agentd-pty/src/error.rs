// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("PTY session {0} not found")]
    NotFound(String),

    #[error("PTY session {0} is closed")]
    Closed(String),

    #[error("unknown special key {0:?}")]
    UnknownKey(String),

    #[error("failed to spawn PTY: {0}")]
    Spawn(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
