// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::{ChatCompletion, CompletionRequest};

/// Provider adapter interface consumed by the kernel.
///
/// Adapters normalize their wire format into [`ChatCompletion`]; the kernel
/// never sees provider-specific JSON.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name; also the prefix recognised in model identifiers
    /// (`ollama:qwen3:8b` routes to the provider named `ollama`).
    fn name(&self) -> &str;

    /// Return `true` when this provider claims a bare model name
    /// (one without a `prefix:`).  The default claims nothing.
    fn accepts(&self, _model: &str) -> bool {
        false
    }

    async fn create_chat_completion(
        &self,
        req: CompletionRequest,
    ) -> anyhow::Result<ChatCompletion>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("no provider for model {0:?}")]
    NoProvider(String),
}

/// Routes model identifiers to registered providers.
///
/// Resolution order:
/// 1. `prefix:rest` — the prefix names a provider; `rest` is the model
///    forwarded to it (the rest may itself contain colons).
/// 2. Bare name — the first provider whose [`LlmProvider::accepts`]
///    predicate matches, in registration order.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.push(provider);
    }

    /// Resolve a model identifier to `(provider, bare model name)`.
    pub fn resolve(&self, model: &str) -> Result<(Arc<dyn LlmProvider>, String), ProviderError> {
        if let Some((prefix, rest)) = model.split_once(':') {
            if let Some(p) = self.providers.iter().find(|p| p.name() == prefix) {
                debug!(provider = prefix, model = rest, "resolved by prefix");
                return Ok((Arc::clone(p), rest.to_string()));
            }
        }
        if let Some(p) = self.providers.iter().find(|p| p.accepts(model)) {
            debug!(provider = p.name(), model, "resolved by pattern");
            return Ok((Arc::clone(p), model.to_string()));
        }
        Err(ProviderError::NoProvider(model.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
