//! LLM provider access: provider contract and registry, request resolution,
//! retry policy, and the OpenAI and Gemini HTTP providers.

pub mod gemini;
pub mod openai;
pub mod provider;
pub mod resolver;
pub mod retry;
#[cfg(test)]
mod stub_server;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use provider::{ChatMessage, LlmProvider, LlmRequest, LlmResponse, ProviderRegistry};
pub use resolver::{resolve_llm_request, LlmDefaults, ResolvedLlmRequest};
pub use retry::RetryPolicy;

use crate::config::LlmConfig;
use crate::error::Result;
use std::sync::Arc;

/// LLM configuration plus the provider registry injected into every run
#[derive(Debug, Clone)]
pub struct LlmRuntime {
    pub config: LlmConfig,
    pub providers: ProviderRegistry,
}

impl LlmRuntime {
    pub fn new(config: LlmConfig, providers: ProviderRegistry) -> Self {
        Self { config, providers }
    }

    /// Registry with the built-in `openai` and `gemini` providers
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let retry = RetryPolicy::from(&config.retry);
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(OpenAiProvider::new(
            config.openai.clone(),
            retry.clone(),
        )?));
        providers.register(Arc::new(GeminiProvider::new(config.gemini.clone(), retry)?));
        Ok(Self::new(config.clone(), providers))
    }

    /// Default configuration with no providers; LLM strategies fail to resolve
    pub fn empty() -> Self {
        Self::new(LlmConfig::default(), ProviderRegistry::new())
    }
}
