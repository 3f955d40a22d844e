//! Scripted strategies and an LLM provider with fixed behaviour and call counters.
//!
//! Used by unit and integration tests to drive the orchestration engine without
//! network access.

use crate::config::Overrides;
use crate::domain::EventMarketGroup;
use crate::error::{ExecutionError, LlmCallError};
use crate::experiments::fingerprint::hash_payload;
use crate::experiments::strategy::{
    ForecastOutput, ForecastStrategy, ResearchInputs, ResearchOutput, ResearchStrategy,
    Stage, StrategyContext, StrategyError, StrategyInfo, StrategyOutcome,
};
use crate::llm::{LlmProvider, LlmRequest, LlmResponse};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// What a scripted strategy does when invoked
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedBehavior {
    Succeed,
    Skip(String),
    Fail(String),
    /// Fails only for the group whose event id (or `none`) matches
    FailForEvent { event_id: String, message: String },
}

impl ScriptedBehavior {
    fn outcome_for(&self, group: &EventMarketGroup) -> Option<StrategyOutcome<()>> {
        match self {
            ScriptedBehavior::Succeed => None,
            ScriptedBehavior::Skip(reason) => Some(StrategyOutcome::Skipped(reason.clone())),
            ScriptedBehavior::Fail(message) => {
                Some(StrategyOutcome::Failed(ExecutionError::new(message.clone())))
            }
            ScriptedBehavior::FailForEvent { event_id, message } => {
                if group.event_label() == event_id {
                    Some(StrategyOutcome::Failed(ExecutionError::new(message.clone())))
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StaticResearch {
    name: String,
    version: String,
    shared_identity: Option<String>,
    payload: Option<Value>,
    declares_hash: bool,
    behavior: ScriptedBehavior,
    calls: Arc<AtomicUsize>,
}

impl StaticResearch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0".to_string(),
            shared_identity: None,
            payload: None,
            declares_hash: true,
            behavior: ScriptedBehavior::Succeed,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Leave `artifact_hash` unset so the store derives one
    pub fn without_hash(mut self) -> Self {
        self.declares_hash = false;
        self
    }

    pub fn shared(mut self, identity: impl Into<String>) -> Self {
        self.shared_identity = Some(identity.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn behavior(mut self, behavior: ScriptedBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Count invocations into an externally owned counter
    pub fn counter(mut self, calls: Arc<AtomicUsize>) -> Self {
        self.calls = calls;
        self
    }
}

#[async_trait]
impl ResearchStrategy for StaticResearch {
    fn info(&self) -> StrategyInfo {
        StrategyInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            description: Some("Scripted research".to_string()),
            shared_identity: self.shared_identity.clone(),
        }
    }

    async fn run(
        &self,
        group: &EventMarketGroup,
        ctx: &StrategyContext<'_>,
    ) -> StrategyOutcome<ResearchOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior.outcome_for(group) {
            Some(StrategyOutcome::Skipped(reason)) => return StrategyOutcome::Skipped(reason),
            Some(StrategyOutcome::Failed(err)) => return StrategyOutcome::Failed(err),
            _ => {}
        }
        let payload = self.payload.clone().unwrap_or_else(|| {
            json!({
                "strategy": self.name,
                "event_id": group.event_label(),
                "markets": group.markets.iter().map(|m| m.market_id.clone()).collect::<Vec<_>>(),
            })
        });
        StrategyOutcome::Success(ResearchOutput {
            artifact_hash: if self.declares_hash {
                hash_payload(&payload)
            } else {
                None
            },
            payload,
            artifact_uri: None,
            diagnostics: Some(json!({"experiment": ctx.experiment_name})),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StaticForecast {
    name: String,
    version: String,
    requires: Vec<String>,
    probability: f64,
    behavior: ScriptedBehavior,
    foreign_market: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl StaticForecast {
    pub fn new(name: impl Into<String>, requires: &[&str]) -> Self {
        Self {
            name: name.into(),
            version: "1.0".to_string(),
            requires: requires.iter().map(|r| r.to_string()).collect(),
            probability: 0.6,
            behavior: ScriptedBehavior::Succeed,
            foreign_market: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    pub fn behavior(mut self, behavior: ScriptedBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Emit an extra forecast for a market outside the group
    pub fn foreign_market(mut self, market_id: impl Into<String>) -> Self {
        self.foreign_market = Some(market_id.into());
        self
    }

    pub fn counter(mut self, calls: Arc<AtomicUsize>) -> Self {
        self.calls = calls;
        self
    }

    fn forecast_for(&self, market_id: &str, research: &ResearchInputs) -> ForecastOutput {
        let mut prices = BTreeMap::new();
        prices.insert("Yes".to_string(), self.probability);
        prices.insert("No".to_string(), 1.0 - self.probability);
        ForecastOutput {
            market_id: market_id.to_string(),
            outcome_prices: prices,
            reasoning: format!(
                "{} using [{}]",
                self.name,
                research.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
            score: None,
            artifact_uri: None,
            diagnostics: None,
        }
    }
}

#[async_trait]
impl ForecastStrategy for StaticForecast {
    fn info(&self) -> StrategyInfo {
        StrategyInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            description: Some("Scripted forecast".to_string()),
            shared_identity: None,
        }
    }

    fn requires(&self) -> Vec<String> {
        self.requires.clone()
    }

    async fn run(
        &self,
        group: &EventMarketGroup,
        research: &ResearchInputs,
        _ctx: &StrategyContext<'_>,
    ) -> StrategyOutcome<Vec<ForecastOutput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior.outcome_for(group) {
            Some(StrategyOutcome::Skipped(reason)) => return StrategyOutcome::Skipped(reason),
            Some(StrategyOutcome::Failed(err)) => return StrategyOutcome::Failed(err),
            _ => {}
        }
        let mut outputs: Vec<ForecastOutput> = group
            .markets
            .iter()
            .map(|market| self.forecast_for(&market.market_id, research))
            .collect();
        if let Some(foreign) = &self.foreign_market {
            outputs.push(self.forecast_for(foreign, research));
        }
        StrategyOutcome::Success(outputs)
    }
}

/// Provider answering every call with the same JSON payload
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    payload: Value,
    ready: bool,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            ready: true,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Report missing credentials so strategies skip
    pub fn without_key(mut self) -> Self {
        self.ready = false;
        self
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn last_request(&self) -> Option<LlmRequest> {
        self.requests().pop()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn ensure_ready(&self, _overrides: &Overrides, experiment_name: &str) -> Result<(), StrategyError> {
        if self.ready {
            Ok(())
        } else {
            Err(StrategyError::Skip(format!(
                "{} API key is not configured; skipping experiment '{experiment_name}'",
                self.name
            )))
        }
    }

    fn default_model(&self, stage: Stage) -> Option<String> {
        Some(format!("{}-{}", self.name, stage.as_str()))
    }

    fn default_tools(&self, _stage: Stage) -> Option<Vec<Value>> {
        None
    }

    fn json_mode_options(&self, schema_name: &str, _schema: &Value) -> Result<Overrides, ExecutionError> {
        let mut options = Overrides::new();
        options.insert("schema_name".to_string(), json!(schema_name));
        Ok(options)
    }

    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse, LlmCallError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        Ok(LlmResponse {
            provider: self.name.clone(),
            raw: self.payload.clone(),
            response_id: Some(format!("{}-response", self.name)),
        })
    }

    fn extract_json(&self, response: &LlmResponse) -> Result<Value, ExecutionError> {
        Ok(response.raw.clone())
    }

    fn usage(&self, _response: &LlmResponse) -> Option<Value> {
        None
    }
}
