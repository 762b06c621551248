// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod atomic;
mod channels;
mod document;
mod error;
mod ids;
mod store;

pub use atomic::write_atomic;
pub use channels::{ChannelDocument, ChannelMetadata, ChannelSpec, ChannelStore};
pub use document::{
    render_system_prompt, SessionDocument, SessionMetadata, SessionSpec, SessionSummary,
    API_VERSION, KIND_AGENT,
};
pub use error::StoreError;
pub use ids::IdAllocator;
pub use store::SessionStore;
