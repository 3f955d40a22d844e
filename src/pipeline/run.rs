//! Daily pipeline run: fetch, normalize, group, execute experiments, persist.

use crate::config::AppConfig;
use crate::domain::{normalize_market, EventMarketGroup};
use crate::dump::write_group_dump;
use crate::error::Result;
use crate::experiments::{
    plan_research_bundles, ExperimentOverrides, ExperimentRunMeta, ExperimentSuite,
    GroupExecution, RunContext, RunMetadataTracker, Stage, StageExecutor, StageSelection,
};
use crate::ingestion::{daily_window_filters, resolve_dates, MarketSource};
use crate::llm::LlmRuntime;
use crate::persistence::{
    ExperimentResultInput, ExperimentRunInput, PipelineSession, ProcessedEventInput,
    ProcessedMarketInput, ProcessingFailureInput, ProcessingRunInput, ResearchArtifactInput,
    RunFinalization, SessionFactory,
};
use crate::pipeline::grouping::GroupBuilder;
use crate::pipeline::payloads::{
    artifact_hash, dependency_artifacts, enrich_payload, forecast_payload, primary_artifact,
};
use crate::pipeline::summary::{write_json_report, PipelineSummary};
use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Per-invocation options of a pipeline run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_date: NaiveDate,
    pub window_days: i64,
    /// Explicit close date; redefines `window_days`
    pub target_date: Option<NaiveDate>,
    pub dry_run: bool,
    /// Stop after this many raw markets
    pub limit: Option<usize>,
    pub selection: StageSelection,
    pub debug_dump_dir: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
    /// Generated when absent
    pub run_id: Option<String>,
    pub git_sha: Option<String>,
}

impl RunOptions {
    pub fn new(run_date: NaiveDate, window_days: i64) -> Self {
        Self {
            run_date,
            window_days,
            target_date: None,
            dry_run: false,
            limit: None,
            selection: StageSelection::default(),
            debug_dump_dir: None,
            summary_path: None,
            run_id: None,
            git_sha: None,
        }
    }
}

/// Runs the daily pipeline against a market source and a store
pub struct PipelineRunner<'a> {
    config: &'a AppConfig,
    source: &'a dyn MarketSource,
    sessions: &'a dyn SessionFactory,
    llm: Arc<LlmRuntime>,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(
        config: &'a AppConfig,
        source: &'a dyn MarketSource,
        sessions: &'a dyn SessionFactory,
        llm: Arc<LlmRuntime>,
    ) -> Self {
        Self {
            config,
            source,
            sessions,
            llm,
        }
    }

    #[instrument(skip_all)]
    pub async fn run(&self, suites: &[ExperimentSuite], options: &RunOptions) -> Result<PipelineSummary> {
        let (window_days, target_date) =
            resolve_dates(options.run_date, options.window_days, options.target_date)?;
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut summary = PipelineSummary::new(&run_id, options.run_date, target_date, window_days);

        info!(
            "Starting pipeline run {} (run_date={}, target_date={}, window_days={}, dry_run={})",
            run_id, options.run_date, target_date, window_days, options.dry_run
        );
        if self.config.pipeline.events_concurrency > 1 {
            info!(
                "events_concurrency={} configured; event groups are processed sequentially",
                self.config.pipeline.events_concurrency
            );
        }

        let mut overrides = ExperimentOverrides::new(self.config.experiments.clone());
        for suite in suites {
            for (experiment_name, declared) in suite.declared_overrides() {
                overrides.declare(experiment_name, declared);
            }
        }
        let bundles = plan_research_bundles(suites, &overrides);
        let shared = bundles.iter().filter(|b| b.shared).count();
        info!(
            "Planned {} research bundles ({} shared) across {} suites",
            bundles.len(),
            shared,
            suites.len()
        );

        let ctx = RunContext {
            run_id: run_id.clone(),
            run_date: options.run_date,
            target_date,
            window_days,
            dry_run: options.dry_run,
            llm: Arc::clone(&self.llm),
            overrides: Arc::new(overrides),
        };
        let mut tracker = RunMetadataTracker::from_suites(suites);

        let session = if options.dry_run {
            None
        } else {
            let session = self.sessions.begin().await?;
            session
                .create_processing_run(&ProcessingRunInput {
                    run_id: run_id.clone(),
                    run_date: options.run_date,
                    window_days,
                    target_date,
                    git_sha: options.git_sha.clone(),
                    environment: Some(self.config.environment.clone()),
                })
                .await?;
            for meta in tracker.metas() {
                session
                    .record_experiment_run(&experiment_run_input(meta, &run_id, false))
                    .await?;
            }
            Some(session)
        };

        let groups = self.collect_groups(options, target_date, &mut summary, session.as_deref()).await?;
        info!(
            "Fetched {} markets into {} event groups",
            summary.total_markets,
            groups.len()
        );

        let executor = StageExecutor::new(suites, &bundles, &options.selection, &ctx);
        let expect_forecasts = options.selection.is_active(Stage::Forecast);

        for group in &groups {
            let execution = match executor.execute_group(group, &mut tracker).await {
                Ok(execution) => execution,
                Err(err) => {
                    warn!(
                        "Experiment execution failed for event {}; marking {} markets failed: {}",
                        group.event_label(),
                        group.markets.len(),
                        err
                    );
                    for market in &group.markets {
                        summary.record_failure(&market.market_id, format!("experiment_failed: {err}"));
                        if let Some(session) = session.as_deref() {
                            session
                                .record_processing_failure(&ProcessingFailureInput {
                                    run_id: run_id.clone(),
                                    market_id: Some(market.market_id.clone()),
                                    reason: "experiment_failed".to_string(),
                                    retriable: true,
                                    details: Some(json!({"message": err.to_string()})),
                                })
                                .await?;
                        }
                    }
                    continue;
                }
            };
            summary.distinct_research_executions += execution.research_executions;
            summary.shared_research_reuses += execution.shared_reuses;

            if let Some(base) = &options.debug_dump_dir {
                for suite in suites {
                    let suite_id = suite.suite_id();
                    if let Err(e) = write_group_dump(
                        base,
                        &run_id,
                        suite_id,
                        group,
                        execution.research.get(suite_id),
                        execution.forecasts_for_suite(suite_id),
                    ) {
                        error!(
                            "Failed to write debug dump for suite {} event {}: {}",
                            suite_id,
                            group.event_label(),
                            e
                        );
                    }
                }
            }

            if expect_forecasts && execution.forecasts.is_empty() {
                for market in &group.markets {
                    warn!(
                        "No forecast results returned for market {}; skipping persistence",
                        market.market_id
                    );
                    summary.record_failure(&market.market_id, "no_forecast_results");
                    if let Some(session) = session.as_deref() {
                        session
                            .record_processing_failure(&ProcessingFailureInput {
                                run_id: run_id.clone(),
                                market_id: Some(market.market_id.clone()),
                                reason: "no_forecast_results".to_string(),
                                retriable: false,
                                details: None,
                            })
                            .await?;
                    }
                }
                continue;
            }

            summary.processed_markets += group.markets.len();
            if let Some(session) = session.as_deref() {
                persist_group(session, &run_id, group, &execution).await?;
            }
        }

        let finished_at = Utc::now();
        tracker.finalize(finished_at);

        if let Some(session) = session {
            session
                .finalize_processing_run(
                    &run_id,
                    &RunFinalization {
                        status: summary.status(),
                        total_markets: summary.total_markets,
                        processed_markets: summary.processed_markets,
                        failed_markets: summary.failed_markets,
                        finished_at,
                    },
                )
                .await?;
            for meta in tracker.metas() {
                session
                    .record_experiment_run(&experiment_run_input(meta, &run_id, true))
                    .await?;
            }
            session.commit().await?;
        }

        for meta in tracker.metas() {
            summary.record_experiment_meta(meta);
        }

        info!(
            "Pipeline run {} completed. processed={}, failed={}, total={}",
            run_id, summary.processed_markets, summary.failed_markets, summary.total_markets
        );
        if let Some(path) = &options.summary_path {
            write_json_report(path, &summary)?;
            info!("Wrote pipeline summary to {}", path.display());
        }
        if summary.failed_markets > 0 {
            warn!("Pipeline completed with {} failures", summary.failed_markets);
        }

        Ok(summary)
    }

    /// Fetch the target window, normalize, and bucket into groups.
    ///
    /// Normalization failures are recorded and the market is dropped.
    async fn collect_groups(
        &self,
        options: &RunOptions,
        target_date: NaiveDate,
        summary: &mut PipelineSummary,
        session: Option<&dyn PipelineSession>,
    ) -> Result<Vec<EventMarketGroup>> {
        let filters = daily_window_filters(&self.config.ingestion.filters, target_date);
        let raw_markets = self.source.fetch_markets(&filters).await?;
        let mut builder = GroupBuilder::new();

        for (index, raw) in raw_markets.iter().enumerate() {
            if let Some(limit) = options.limit.filter(|l| index >= *l) {
                info!("Limit reached ({}); stopping early", limit);
                break;
            }
            summary.total_markets += 1;

            match normalize_market(raw) {
                Ok(market) => builder.push(market),
                Err(e) => {
                    let market_id = raw.get("id").and_then(raw_id);
                    error!(
                        "Normalization failed for market payload {}: {}",
                        market_id.as_deref().unwrap_or("unknown"),
                        e
                    );
                    summary.record_failure(
                        market_id.clone().unwrap_or_else(|| "unknown".to_string()),
                        format!("normalization_failed: {e}"),
                    );
                    if let Some(session) = session {
                        session
                            .record_processing_failure(&ProcessingFailureInput {
                                run_id: summary.run_id.clone(),
                                market_id,
                                reason: "normalization_failed".to_string(),
                                retriable: true,
                                details: Some(json!({"message": e.to_string()})),
                            })
                            .await?;
                    }
                }
            }
        }

        debug!(
            "Grouped {} markets into {} groups",
            builder.market_count(),
            builder.group_count()
        );
        Ok(builder.finish())
    }
}

fn raw_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn experiment_run_input(meta: &ExperimentRunMeta, run_id: &str, finished: bool) -> ExperimentRunInput {
    let (status, finished_at, error_message) = if finished {
        (meta.final_status(), meta.finished_at, meta.error_summary())
    } else {
        (meta.status, None, None)
    };
    ExperimentRunInput {
        experiment_run_id: meta.run_identifier.clone(),
        run_id: run_id.to_string(),
        experiment_name: meta.experiment_name.clone(),
        experiment_version: meta.strategy_version.clone(),
        description: meta.description.clone(),
        stage: meta.stage,
        status: status.as_str().to_string(),
        started_at: meta.started_at,
        finished_at,
        error_message,
    }
}

/// Processed snapshots, research artifacts, and forecast results of one group
async fn persist_group(
    session: &dyn PipelineSession,
    run_id: &str,
    group: &EventMarketGroup,
    execution: &GroupExecution,
) -> Result<()> {
    let event = group.event.as_ref();
    let processed_event_id = session
        .record_processed_event(&ProcessedEventInput {
            processed_event_id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            event_key: group.event_key().unwrap_or_default(),
            event_id: event.map(|e| e.event_id.clone()),
            event_slug: event.and_then(|e| e.slug.clone()),
            event_title: event.and_then(|e| e.title.clone()),
            raw_snapshot: event.and_then(|e| e.raw_data.clone()),
        })
        .await?;

    let mut processed_markets: HashMap<&str, String> = HashMap::new();
    for market in &group.markets {
        let id = session
            .record_processed_market(&ProcessedMarketInput::from_market(
                Uuid::new_v4().to_string(),
                run_id,
                market,
                market.raw_data.clone(),
                Some(processed_event_id.clone()),
            ))
            .await?;
        processed_markets.insert(market.market_id.as_str(), id);
        session.upsert_market(market).await?;
    }

    for records in execution.research.values() {
        for record in records.values() {
            let output = &record.output;
            let payload = enrich_payload(&output.payload, output.diagnostics.as_ref(), None);
            session
                .record_research_artifact(&ResearchArtifactInput {
                    artifact_id: record.artifact_id.clone(),
                    experiment_run_id: record.experiment_run_id.clone(),
                    processed_market_id: None,
                    processed_event_id: Some(processed_event_id.clone()),
                    variant_name: record.strategy_name.clone(),
                    variant_version: record.strategy_version.clone(),
                    artifact_hash: artifact_hash(output.artifact_hash.as_deref(), payload.as_ref()),
                    payload: payload.clone(),
                    artifact_uri: output.artifact_uri.clone(),
                })
                .await?;
            session
                .record_experiment_result(&ExperimentResultInput {
                    experiment_run_id: record.experiment_run_id.clone(),
                    processed_market_id: None,
                    processed_event_id: Some(processed_event_id.clone()),
                    stage: Stage::Research,
                    variant_name: Some(record.strategy_name.clone()),
                    variant_version: Some(record.strategy_version.clone()),
                    source_artifact_id: Some(record.artifact_id.clone()),
                    payload,
                    score: None,
                    artifact_uri: output.artifact_uri.clone(),
                })
                .await?;
        }
    }

    for forecast in &execution.forecasts {
        let Some(processed_market_id) = processed_markets.get(forecast.output.market_id.as_str())
        else {
            warn!(
                "Missing processed market mapping for forecast market {}; skipping result",
                forecast.output.market_id
            );
            continue;
        };
        let links = dependency_artifacts(
            &forecast.dependencies,
            execution.research.get(&forecast.suite_id),
        );
        session
            .record_experiment_result(&ExperimentResultInput {
                experiment_run_id: forecast.experiment_run_id.clone(),
                processed_market_id: Some(processed_market_id.clone()),
                processed_event_id: Some(processed_event_id.clone()),
                stage: Stage::Forecast,
                variant_name: Some(forecast.strategy_name.clone()),
                variant_version: Some(forecast.strategy_version.clone()),
                source_artifact_id: primary_artifact(&links),
                payload: forecast_payload(&forecast.output, &links),
                score: forecast.output.score,
                artifact_uri: forecast.output.artifact_uri.clone(),
            })
            .await?;
    }

    debug!(
        "Persisted event {} with {} markets, {} forecasts",
        group.event_label(),
        group.markets.len(),
        execution.forecasts.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiments::testing::{StaticForecast, StaticResearch};
    use crate::experiments::{ForecastFactory, ResearchFactory};
    use crate::ingestion::MockMarketSource;
    use crate::persistence::InMemoryStore;

    fn raw(id: &str, event: Option<&str>) -> Value {
        let mut market = json!({
            "id": id,
            "question": format!("Question {id}?"),
            "outcomes": "[\"Yes\", \"No\"]",
            "outcomePrices": "[\"0.4\", \"0.6\"]",
        });
        if let Some(event) = event {
            market["events"] = json!([{"id": event, "title": format!("Event {event}")}]);
        }
        market
    }

    fn suite() -> ExperimentSuite {
        ExperimentSuite::builder("s1")
            .research(ResearchFactory::research(|| StaticResearch::new("r1")))
            .forecast(ForecastFactory::forecast(|| StaticForecast::new("f1", &["r1"])).requires(["r1"]))
            .build()
            .unwrap()
    }

    fn options() -> RunOptions {
        let mut options = RunOptions::new(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(), 1);
        options.run_id = Some("run-1".to_string());
        options
    }

    #[tokio::test]
    async fn test_limit_and_normalization_failures() {
        let mut source = MockMarketSource::new();
        source.expect_fetch_markets().times(1).returning(|filters| {
            assert_eq!(filters["closed"], json!(false));
            Ok(vec![json!({"question": "no id"}), raw("m1", Some("e1")), raw("m2", Some("e1"))])
        });
        let store = InMemoryStore::new();
        let config = AppConfig::default_config();
        let runner = PipelineRunner::new(&config, &source, &store, Arc::new(LlmRuntime::empty()));

        let mut opts = options();
        opts.limit = Some(2);
        let summary = runner.run(&[suite()], &opts).await.unwrap();

        assert_eq!(summary.total_markets, 2);
        assert_eq!(summary.processed_markets, 1);
        assert_eq!(summary.failed_markets, 1);
        assert_eq!(summary.failures[0].market_id, "unknown");
        assert!(summary.failures[0].reason.starts_with("normalization_failed: "));

        let state = store.snapshot();
        assert_eq!(state.runs["run-1"].status, "completed_with_errors");
        assert_eq!(state.failures[0].reason, "normalization_failed");
        assert!(state.failures[0].retriable);
    }

    #[tokio::test]
    async fn test_dry_run_skips_persistence() {
        let mut source = MockMarketSource::new();
        source
            .expect_fetch_markets()
            .returning(|_| Ok(vec![raw("m1", Some("e1"))]));
        let store = InMemoryStore::new();
        let config = AppConfig::default_config();
        let runner = PipelineRunner::new(&config, &source, &store, Arc::new(LlmRuntime::empty()));

        let mut opts = options();
        opts.dry_run = true;
        let summary = runner.run(&[suite()], &opts).await.unwrap();
        assert_eq!(summary.processed_markets, 1);
        assert_eq!(summary.distinct_research_executions, 1);
        assert_eq!(summary.suite_stats["s1"].forecast.completed, 1);
        assert!(store.snapshot().runs.is_empty());
    }

    #[tokio::test]
    async fn test_forecast_links_single_research_artifact() {
        let mut source = MockMarketSource::new();
        source
            .expect_fetch_markets()
            .returning(|_| Ok(vec![raw("m1", Some("e1")), raw("m2", Some("e1"))]));
        let store = InMemoryStore::new();
        let config = AppConfig::default_config();
        let runner = PipelineRunner::new(&config, &source, &store, Arc::new(LlmRuntime::empty()));

        let summary = runner.run(&[suite()], &options()).await.unwrap();
        assert_eq!(summary.processed_markets, 2);

        let state = store.snapshot();
        assert_eq!(state.artifacts.len(), 1);
        let artifact_id = state.artifacts.keys().next().cloned();
        let forecasts: Vec<_> = state
            .results
            .values()
            .filter(|r| r.stage == Stage::Forecast)
            .collect();
        assert_eq!(forecasts.len(), 2);
        for result in forecasts {
            assert_eq!(result.source_artifact_id, artifact_id);
            let payload = result.payload.as_ref().unwrap();
            assert_eq!(payload["outcomePrices"]["Yes"], json!(0.6));
            assert!(payload["_research_artifacts"]["r1"].is_string());
        }
        let runs: Vec<_> = state.experiment_runs.values().collect();
        assert!(runs.iter().all(|r| r.status == "completed" && r.finished_at.is_some()));
    }
}
