use crate::config::Overrides;
use crate::error::{ExecutionError, LlmCallError};
use crate::experiments::strategy::{Stage, StrategyError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Chat message in provider-neutral form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Fully resolved provider call
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub options: Overrides,
    /// `None` leaves tools out of the request; `Some(vec![])` sends an explicit empty list
    pub tools: Option<Vec<Value>>,
    /// Experiment overrides, for credentials and endpoint overrides
    pub overrides: Overrides,
    pub run_id: String,
    pub experiment_name: String,
    pub strategy_name: String,
    pub stage: Stage,
}

/// Raw provider response
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub provider: String,
    pub raw: Value,
    pub response_id: Option<String>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Skip when credentials are missing, unless overrides carry their own
    fn ensure_ready(&self, overrides: &Overrides, experiment_name: &str) -> Result<(), StrategyError>;

    fn default_model(&self, stage: Stage) -> Option<String>;

    fn default_request_options(&self, _stage: Stage) -> Overrides {
        Overrides::new()
    }

    fn default_tools(&self, stage: Stage) -> Option<Vec<Value>>;

    /// Request options enabling structured JSON output for `schema`
    fn json_mode_options(&self, schema_name: &str, schema: &Value) -> Result<Overrides, ExecutionError>;

    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse, LlmCallError>;

    fn extract_json(&self, response: &LlmResponse) -> Result<Value, ExecutionError>;

    fn usage(&self, response: &LlmResponse) -> Option<Value>;
}

/// Provider implementations available to a run, keyed by lowercase name
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a provider
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers
            .insert(provider.name().to_lowercase(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn LlmProvider>, ExecutionError> {
        self.providers
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| ExecutionError::new(format!("LLM provider '{name}' is not registered")))
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
