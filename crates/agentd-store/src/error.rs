// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("template {0} not found")]
    TemplateNotFound(String),

    #[error("channel {0} not found")]
    ChannelNotFound(String),

    #[error("corrupt document: {0}")]
    Corrupt(String),

    /// A partially written or non-numeric ID counter.  Fatal: the daemon
    /// must not allocate IDs from a counter it cannot trust.
    #[error("corrupt session ID counter at {0}")]
    CorruptCounter(PathBuf),

    #[error("message index {index} out of range for session {session}")]
    MessageOutOfRange { session: String, index: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
