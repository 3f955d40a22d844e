//! Strategy contracts for the two experiment stages.
//!
//! Research strategies run once per event group and produce a content-hashed
//! artifact; forecast strategies consume the research artifacts of their own suite
//! and produce one [`ForecastOutput`] per market. Both report a three-state
//! [`StrategyOutcome`] instead of signalling skips through errors.

use crate::config::Overrides;
use crate::domain::EventMarketGroup;
use crate::error::ExecutionError;
use crate::experiments::overrides::ExperimentOverrides;
use crate::llm::LlmRuntime;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The two ordered phases of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Research,
    Forecast,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Research, Stage::Forecast];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Research => "research",
            Stage::Forecast => "forecast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "research" => Some(Stage::Research),
            "forecast" => Some(Stage::Forecast),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output of one executed research strategy invocation.
///
/// Shared by reference (`Arc`) across every suite consuming the same bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchOutput {
    pub payload: Value,
    #[serde(default)]
    pub artifact_uri: Option<String>,
    #[serde(default)]
    pub artifact_hash: Option<String>,
    #[serde(default)]
    pub diagnostics: Option<Value>,
}

impl ResearchOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            artifact_uri: None,
            artifact_hash: None,
            diagnostics: None,
        }
    }
}

/// Forecast for one market of the group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastOutput {
    pub market_id: String,
    /// Outcome name to probability in [0, 1]; not required to sum to exactly 1
    pub outcome_prices: BTreeMap<String, f64>,
    pub reasoning: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub artifact_uri: Option<String>,
    #[serde(default)]
    pub diagnostics: Option<Value>,
}

/// Result of a strategy invocation
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome<T> {
    Success(T),
    /// Soft, expected skip (missing credentials, unsupported input)
    Skipped(String),
    /// Hard failure; aborts the current event group
    Failed(ExecutionError),
}

/// Early-exit error used inside strategy bodies so `?` can be used freely
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyError {
    Skip(String),
    Execution(ExecutionError),
}

impl From<ExecutionError> for StrategyError {
    fn from(err: ExecutionError) -> Self {
        StrategyError::Execution(err)
    }
}

impl<T> From<Result<T, StrategyError>> for StrategyOutcome<T> {
    fn from(result: Result<T, StrategyError>) -> Self {
        match result {
            Ok(value) => StrategyOutcome::Success(value),
            Err(StrategyError::Skip(reason)) => StrategyOutcome::Skipped(reason),
            Err(StrategyError::Execution(err)) => StrategyOutcome::Failed(err),
        }
    }
}

/// Default identity a strategy reports before suite-level aliasing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyInfo {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    /// Cross-suite reuse key; equal identity + version + override fingerprint share one execution
    pub shared_identity: Option<String>,
}

/// Run-scoped context shared by every strategy invocation
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub run_date: NaiveDate,
    pub target_date: NaiveDate,
    pub window_days: i64,
    pub dry_run: bool,
    pub llm: Arc<LlmRuntime>,
    pub overrides: Arc<ExperimentOverrides>,
}

/// Per-invocation view: which experiment is running and with what overrides
pub struct StrategyContext<'a> {
    pub run: &'a RunContext,
    pub suite_id: &'a str,
    pub stage: Stage,
    pub strategy_name: &'a str,
    pub experiment_name: &'a str,
    pub overrides: Overrides,
}

impl<'a> StrategyContext<'a> {
    pub fn new(
        run: &'a RunContext,
        suite_id: &'a str,
        stage: Stage,
        strategy_name: &'a str,
        experiment_name: &'a str,
    ) -> Self {
        let overrides = run.overrides.get(experiment_name);
        Self {
            run,
            suite_id,
            stage,
            strategy_name,
            experiment_name,
            overrides,
        }
    }
}

/// Research outputs available to a suite's forecasts, keyed by research strategy name
pub type ResearchInputs = BTreeMap<String, Arc<ResearchOutput>>;

#[async_trait]
pub trait ResearchStrategy: Send + Sync {
    fn info(&self) -> StrategyInfo;

    async fn run(
        &self,
        group: &EventMarketGroup,
        ctx: &StrategyContext<'_>,
    ) -> StrategyOutcome<ResearchOutput>;
}

#[async_trait]
pub trait ForecastStrategy: Send + Sync {
    fn info(&self) -> StrategyInfo;

    /// Research strategy names (within the same suite) this forecast consumes
    fn requires(&self) -> Vec<String>;

    /// Invoked once per group; iterates the group's markets internally
    async fn run(
        &self,
        group: &EventMarketGroup,
        research: &ResearchInputs,
        ctx: &StrategyContext<'_>,
    ) -> StrategyOutcome<Vec<ForecastOutput>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse(" Forecast "), Some(Stage::Forecast));
        assert_eq!(Stage::parse("both"), None);
        assert!(Stage::Research < Stage::Forecast);
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: StrategyOutcome<u8> = Ok::<u8, StrategyError>(3).into();
        assert_eq!(ok, StrategyOutcome::Success(3));

        let skipped: StrategyOutcome<u8> =
            Err::<u8, StrategyError>(StrategyError::Skip("no key".into())).into();
        assert_eq!(skipped, StrategyOutcome::Skipped("no key".into()));

        let failed: StrategyOutcome<u8> =
            Err::<u8, StrategyError>(ExecutionError::new("boom").into()).into();
        assert_eq!(failed, StrategyOutcome::Failed(ExecutionError::new("boom")));
    }
}
