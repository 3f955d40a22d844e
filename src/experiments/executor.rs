//! Per-group execution of research bundles followed by forecasts.

use crate::domain::EventMarketGroup;
use crate::error::ExecutionError;
use crate::experiments::bundles::ResearchBundle;
use crate::experiments::run_meta::RunMetadataTracker;
use crate::experiments::strategy::{
    ForecastOutput, ResearchInputs, ResearchOutput, RunContext, Stage, StrategyContext,
    StrategyOutcome,
};
use crate::experiments::suite::ExperimentSuite;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const RESEARCH_STAGE_DISABLED: &str = "research stage disabled by run configuration";
pub const RESEARCH_VARIANT_FILTERED: &str = "research variant filtered by include-research";
pub const FORECAST_STAGE_DISABLED: &str = "forecast stage disabled by run configuration";
pub const FORECAST_VARIANT_FILTERED: &str = "forecast variant filtered by include-forecast";

/// Which stages run and which variants are included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSelection {
    pub active_stages: BTreeSet<Stage>,
    /// `None` selects every research variant
    pub include_research: Option<BTreeSet<String>>,
    /// `None` selects every forecast variant
    pub include_forecast: Option<BTreeSet<String>>,
}

impl Default for StageSelection {
    fn default() -> Self {
        Self {
            active_stages: Stage::ALL.into_iter().collect(),
            include_research: None,
            include_forecast: None,
        }
    }
}

impl StageSelection {
    pub fn new(
        active_stages: impl IntoIterator<Item = Stage>,
        include_research: Option<&str>,
        include_forecast: Option<&str>,
    ) -> Self {
        Self {
            active_stages: active_stages.into_iter().collect(),
            include_research: parse_variant_filter(include_research),
            include_forecast: parse_variant_filter(include_forecast),
        }
    }

    pub fn is_active(&self, stage: Stage) -> bool {
        self.active_stages.contains(&stage)
    }

    pub fn variant_selected(&self, stage: Stage, suite_id: &str, strategy_name: &str) -> bool {
        let selection = match stage {
            Stage::Research => self.include_research.as_ref(),
            Stage::Forecast => self.include_forecast.as_ref(),
        };
        variant_selected(suite_id, strategy_name, selection)
    }
}

/// Comma-separated variant names; empty input selects everything
pub fn parse_variant_filter(raw: Option<&str>) -> Option<BTreeSet<String>> {
    let items: BTreeSet<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// A variant matches by bare name or by `suite_id:name`
pub fn variant_selected(
    suite_id: &str,
    strategy_name: &str,
    selection: Option<&BTreeSet<String>>,
) -> bool {
    match selection {
        None => true,
        Some(set) if set.is_empty() => true,
        Some(set) => {
            set.contains(strategy_name) || set.contains(&format!("{suite_id}:{strategy_name}"))
        }
    }
}

/// Research output attached to one suite's strategy for the current group
#[derive(Debug, Clone)]
pub struct ResearchRecord {
    pub suite_id: String,
    pub strategy_name: String,
    pub strategy_version: String,
    pub experiment_name: String,
    pub experiment_run_id: String,
    pub output: Arc<ResearchOutput>,
    /// Assigned at record creation so dumps and persisted rows carry the same id
    pub artifact_id: String,
    /// Bundle identity when the output was shared across suites
    pub bundle_identity: Option<String>,
}

/// One forecast output tagged with its declared dependencies
#[derive(Debug, Clone)]
pub struct ForecastRecord {
    pub suite_id: String,
    pub strategy_name: String,
    pub strategy_version: String,
    pub experiment_name: String,
    pub experiment_run_id: String,
    pub output: ForecastOutput,
    pub dependencies: Vec<String>,
}

/// suite id -> research strategy name -> record
pub type SuiteResearch = BTreeMap<String, BTreeMap<String, ResearchRecord>>;

/// Everything a group produced
#[derive(Debug, Clone, Default)]
pub struct GroupExecution {
    pub research: SuiteResearch,
    pub forecasts: Vec<ForecastRecord>,
    /// Research strategy invocations actually executed
    pub research_executions: usize,
    /// Extra suites served by a shared execution
    pub shared_reuses: usize,
}

impl GroupExecution {
    pub fn forecasts_for_suite<'a>(
        &'a self,
        suite_id: &'a str,
    ) -> impl Iterator<Item = &'a ForecastRecord> + 'a {
        self.forecasts.iter().filter(move |r| r.suite_id == suite_id)
    }
}

/// Drives both stages for one group at a time
pub struct StageExecutor<'a> {
    suites: &'a [ExperimentSuite],
    bundles: &'a [ResearchBundle],
    selection: &'a StageSelection,
    ctx: &'a RunContext,
}

impl<'a> StageExecutor<'a> {
    pub fn new(
        suites: &'a [ExperimentSuite],
        bundles: &'a [ResearchBundle],
        selection: &'a StageSelection,
        ctx: &'a RunContext,
    ) -> Self {
        Self {
            suites,
            bundles,
            selection,
            ctx,
        }
    }

    /// Research then forecasts; a hard error aborts the whole group
    pub async fn execute_group(
        &self,
        group: &EventMarketGroup,
        tracker: &mut RunMetadataTracker,
    ) -> Result<GroupExecution, ExecutionError> {
        let mut execution = self.execute_research(group, tracker).await?;
        execution.forecasts = self
            .execute_forecasts(group, &execution.research, tracker)
            .await?;
        Ok(execution)
    }

    pub async fn execute_research(
        &self,
        group: &EventMarketGroup,
        tracker: &mut RunMetadataTracker,
    ) -> Result<GroupExecution, ExecutionError> {
        let mut execution = GroupExecution {
            research: self
                .suites
                .iter()
                .map(|s| (s.suite_id().to_string(), BTreeMap::new()))
                .collect(),
            ..GroupExecution::default()
        };

        if !self.selection.is_active(Stage::Research) {
            for member in self.bundles.iter().flat_map(|b| b.members.iter()) {
                if let Some(meta) =
                    tracker.get_mut(&member.suite_id, Stage::Research, &member.strategy_name)
                {
                    meta.mark_skipped(RESEARCH_STAGE_DISABLED);
                }
            }
            return Ok(execution);
        }

        for bundle in self.bundles {
            let mut active = Vec::with_capacity(bundle.members.len());
            for member in &bundle.members {
                if self
                    .selection
                    .variant_selected(Stage::Research, &member.suite_id, &member.strategy_name)
                {
                    active.push(member);
                } else if let Some(meta) =
                    tracker.get_mut(&member.suite_id, Stage::Research, &member.strategy_name)
                {
                    meta.mark_skipped(RESEARCH_VARIANT_FILTERED);
                }
            }

            let Some(canonical) = active.first() else {
                continue;
            };
            let suites_label = active
                .iter()
                .map(|m| m.suite_id.as_str())
                .collect::<Vec<_>>()
                .join(", ");

            let strategy_ctx = StrategyContext::new(
                self.ctx,
                &canonical.suite_id,
                Stage::Research,
                &canonical.strategy_name,
                &canonical.experiment_name,
            );
            debug!(
                "Executing research bundle {} for event {} (suites=[{}])",
                bundle.identity,
                group.event_label(),
                suites_label
            );

            match canonical.strategy.run(group, &strategy_ctx).await {
                StrategyOutcome::Skipped(reason) => {
                    for member in &active {
                        if let Some(meta) = tracker.get_mut(
                            &member.suite_id,
                            Stage::Research,
                            &member.strategy_name,
                        ) {
                            meta.mark_skipped(&reason);
                        }
                    }
                    info!(
                        "Research bundle {} skipped group (suites={}, event={}): {}",
                        bundle.identity,
                        suites_label,
                        group.event_label(),
                        reason
                    );
                }
                StrategyOutcome::Failed(err) => {
                    for member in &active {
                        if let Some(meta) = tracker.get_mut(
                            &member.suite_id,
                            Stage::Research,
                            &member.strategy_name,
                        ) {
                            meta.mark_failed(err.message.clone());
                        }
                    }
                    error!(
                        "Research bundle {} failed for event {}: {}",
                        bundle.identity,
                        group.event_label(),
                        err
                    );
                    return Err(err);
                }
                StrategyOutcome::Success(output) => {
                    let output = Arc::new(output);
                    let bundle_identity = bundle.shared.then(|| bundle.identity.clone());
                    execution.research_executions += 1;
                    execution.shared_reuses += active.len() - 1;

                    for member in &active {
                        let Some(meta) = tracker.get_mut(
                            &member.suite_id,
                            Stage::Research,
                            &member.strategy_name,
                        ) else {
                            continue;
                        };
                        meta.record_success();
                        let record = ResearchRecord {
                            suite_id: member.suite_id.clone(),
                            strategy_name: member.strategy_name.clone(),
                            strategy_version: member.strategy_version.clone(),
                            experiment_name: member.experiment_name.clone(),
                            experiment_run_id: meta.run_identifier.clone(),
                            output: Arc::clone(&output),
                            artifact_id: Uuid::new_v4().to_string(),
                            bundle_identity: bundle_identity.clone(),
                        };
                        execution
                            .research
                            .entry(member.suite_id.clone())
                            .or_default()
                            .insert(member.strategy_name.clone(), record);
                    }

                    if bundle.shared && active.len() > 1 {
                        info!(
                            "Reused research strategy {} across suites [{}] (fingerprint={})",
                            canonical.strategy_name, suites_label, canonical.config_fingerprint
                        );
                    }
                }
            }
        }

        Ok(execution)
    }

    pub async fn execute_forecasts(
        &self,
        group: &EventMarketGroup,
        research: &SuiteResearch,
        tracker: &mut RunMetadataTracker,
    ) -> Result<Vec<ForecastRecord>, ExecutionError> {
        let mut records = Vec::new();

        if !self.selection.is_active(Stage::Forecast) {
            for suite in self.suites {
                for slot in suite.forecasts() {
                    if let Some(meta) =
                        tracker.get_mut(suite.suite_id(), Stage::Forecast, &slot.identity.name)
                    {
                        meta.mark_skipped(FORECAST_STAGE_DISABLED);
                    }
                }
            }
            return Ok(records);
        }

        for suite in self.suites {
            let suite_id = suite.suite_id();
            let available: ResearchInputs = research
                .get(suite_id)
                .map(|records| {
                    records
                        .iter()
                        .map(|(name, record)| (name.clone(), Arc::clone(&record.output)))
                        .collect()
                })
                .unwrap_or_default();

            for slot in suite.forecasts() {
                let name = slot.identity.name.as_str();
                let Some(meta) = tracker.get_mut(suite_id, Stage::Forecast, name) else {
                    warn!("No run metadata for forecast {} in suite {}", name, suite_id);
                    continue;
                };

                if !self.selection.variant_selected(Stage::Forecast, suite_id, name) {
                    meta.mark_skipped(FORECAST_VARIANT_FILTERED);
                    continue;
                }

                let missing: Vec<&str> = slot
                    .requires
                    .iter()
                    .map(String::as_str)
                    .filter(|dep| !available.contains_key(*dep))
                    .collect();
                if !missing.is_empty() {
                    let reason = format!("missing research dependencies: {}", missing.join(", "));
                    meta.mark_skipped(&reason);
                    warn!(
                        "Skipping forecast strategy {} in suite {} due to missing research dependencies: {}",
                        name,
                        suite_id,
                        missing.join(", ")
                    );
                    continue;
                }

                let experiment_name = meta.experiment_name.clone();
                let strategy_ctx = StrategyContext::new(
                    self.ctx,
                    suite_id,
                    Stage::Forecast,
                    name,
                    &experiment_name,
                );

                match slot.strategy.run(group, &available, &strategy_ctx).await {
                    StrategyOutcome::Skipped(reason) => {
                        meta.mark_skipped(&reason);
                        info!(
                            "Forecast strategy {} skipped group (suite {}, event {}): {}",
                            name,
                            suite_id,
                            group.event_label(),
                            reason
                        );
                    }
                    StrategyOutcome::Failed(err) => {
                        meta.mark_failed(err.message.clone());
                        error!(
                            "Forecast strategy {} failed for suite {} and event {}: {}",
                            name,
                            suite_id,
                            group.event_label(),
                            err
                        );
                        return Err(err);
                    }
                    StrategyOutcome::Success(outputs) => {
                        if let Some(foreign) =
                            outputs.iter().find(|o| !group.contains_market(&o.market_id))
                        {
                            let err = ExecutionError::new(format!(
                                "forecast strategy {name} returned market {} outside event group {}",
                                foreign.market_id,
                                group.event_label()
                            ));
                            meta.mark_failed(err.message.clone());
                            error!("{}", err);
                            return Err(err);
                        }
                        meta.record_success();
                        let run_id = meta.run_identifier.clone();
                        let version = meta.strategy_version.clone();
                        records.extend(outputs.into_iter().map(|output| ForecastRecord {
                            suite_id: suite_id.to_string(),
                            strategy_name: name.to_string(),
                            strategy_version: version.clone(),
                            experiment_name: experiment_name.clone(),
                            experiment_run_id: run_id.clone(),
                            output,
                            dependencies: slot.requires.clone(),
                        }));
                    }
                }
            }
        }

        Ok(records)
    }
}
