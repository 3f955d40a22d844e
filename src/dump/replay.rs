//! Replays a run's debug dumps into the store.
//!
//! Every event is written in its own session. Upserts keyed by run and event key,
//! run and market id, artifact id, and result key make re-running a replay safe.

use crate::dump::document::{DumpDocument, DumpEvent, DumpForecast, DumpMarket, DumpResearch};
use crate::error::{PipelineError, Result};
use crate::experiments::{experiment_name, Stage};
use crate::persistence::{
    ExperimentResultInput, ExperimentRunInput, PipelineSession, ProcessedEventInput,
    ProcessedMarketInput, ResearchArtifactInput, SessionFactory,
};
use crate::pipeline::payloads::{
    artifact_hash, enrich_payload, forecast_body, primary_artifact, ArtifactLinks,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

const REPLAYED_STATUS: &str = "replayed";

/// One suite's research and forecasts for an event
#[derive(Debug, Clone, PartialEq)]
pub struct SuiteDump {
    pub suite_id: String,
    pub research: BTreeMap<String, DumpResearch>,
    pub forecasts: BTreeMap<String, BTreeMap<String, DumpForecast>>,
}

/// Every suite's dump of one event, merged
#[derive(Debug, Clone, PartialEq)]
pub struct EventDump {
    pub event_key: String,
    pub event: Option<DumpEvent>,
    pub markets: Vec<DumpMarket>,
    pub suites: BTreeMap<String, SuiteDump>,
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub run_id: String,
    pub dump_dir: PathBuf,
    /// Event keys to replay; empty replays everything
    pub events: Vec<String>,
    pub skip_market_upsert: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub run_id: String,
    pub events_found: usize,
    pub events_replayed: usize,
    pub events_failed: usize,
}

/// Load `<run_dir>/<suite>/*.json` in sorted order, merging suites per event key.
///
/// Unparseable files are logged and skipped.
pub fn load_run_dumps(run_dir: &Path, includes: &BTreeSet<String>) -> Result<Vec<EventDump>> {
    let mut order: Vec<String> = Vec::new();
    let mut events: HashMap<String, EventDump> = HashMap::new();

    let mut suite_dirs: Vec<PathBuf> = std::fs::read_dir(run_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    suite_dirs.sort();

    for suite_dir in suite_dirs {
        let suite_id = suite_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut files: Vec<PathBuf> = std::fs::read_dir(&suite_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
            .collect();
        files.sort();

        for path in files {
            let document: DumpDocument = match std::fs::read_to_string(&path)
                .map_err(PipelineError::from)
                .and_then(|text| serde_json::from_str(&text).map_err(PipelineError::from))
            {
                Ok(document) => document,
                Err(e) => {
                    error!("Failed to parse debug dump {}: {}", path.display(), e);
                    continue;
                }
            };

            let event_key = document.event_key().unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            if !includes.is_empty() && !includes.contains(&event_key) {
                continue;
            }

            let entry = events.entry(event_key.clone()).or_insert_with(|| {
                order.push(event_key.clone());
                EventDump {
                    event_key: event_key.clone(),
                    event: document.event.clone(),
                    markets: document.markets.clone(),
                    suites: BTreeMap::new(),
                }
            });
            entry.suites.insert(
                suite_id.clone(),
                SuiteDump {
                    suite_id: suite_id.clone(),
                    research: document.research,
                    forecasts: document.forecasts,
                },
            );
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|key| events.remove(&key))
        .collect())
}

/// Replay every event of a run directory; per-event failures are logged and counted
pub async fn replay_run(options: &ReplayOptions, sessions: &dyn SessionFactory) -> Result<ReplaySummary> {
    let run_dir = options.dump_dir.join(&options.run_id);
    if !run_dir.is_dir() {
        return Err(PipelineError::InvalidConfig(format!(
            "Run directory {} does not exist",
            run_dir.display()
        )));
    }

    let includes: BTreeSet<String> = options
        .events
        .iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    let events = load_run_dumps(&run_dir, &includes)?;

    let mut summary = ReplaySummary {
        run_id: options.run_id.clone(),
        events_found: events.len(),
        ..ReplaySummary::default()
    };
    if events.is_empty() {
        info!("No events found for run {}; nothing to replay", options.run_id);
        return Ok(summary);
    }

    let suite_count = events
        .iter()
        .flat_map(|e| e.suites.keys())
        .collect::<BTreeSet<_>>()
        .len();
    info!(
        "Discovered {} events across {} suites in {}",
        events.len(),
        suite_count,
        run_dir.display()
    );

    for event in &events {
        let title = event
            .event
            .as_ref()
            .and_then(|e| e.title.clone())
            .unwrap_or_else(|| event.event_key.clone());
        info!(
            "Persisting event {} ({}) with {} suites",
            event.event_key,
            title,
            event.suites.len()
        );
        if options.dry_run {
            info!("Dry-run enabled; skipping database writes for {}", event.event_key);
            continue;
        }

        match replay_event(&options.run_id, event, options.skip_market_upsert, sessions).await {
            Ok(()) => summary.events_replayed += 1,
            Err(e) => {
                summary.events_failed += 1;
                error!("Failed to replay event {}: {}", event.event_key, e);
            }
        }
    }

    info!(
        "Replay of run {} finished: replayed={}, failed={}",
        options.run_id, summary.events_replayed, summary.events_failed
    );
    Ok(summary)
}

async fn ensure_experiment_run(
    session: &dyn PipelineSession,
    run_id: &str,
    experiment_run_id: &str,
    experiment_name: String,
    version: String,
    stage: Stage,
) -> Result<()> {
    session
        .ensure_experiment_run(&ExperimentRunInput {
            experiment_run_id: experiment_run_id.to_string(),
            run_id: run_id.to_string(),
            experiment_name,
            experiment_version: version,
            description: None,
            stage,
            status: REPLAYED_STATUS.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            error_message: None,
        })
        .await
}

async fn replay_event(
    run_id: &str,
    event: &EventDump,
    skip_market_upsert: bool,
    sessions: &dyn SessionFactory,
) -> Result<()> {
    let session = sessions.begin().await?;
    session.ensure_processing_run(run_id).await?;

    let normalized_event = event.event.as_ref().and_then(DumpEvent::to_event);
    let raw_event = event
        .event
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;
    let processed_event_id = session
        .record_processed_event(&ProcessedEventInput {
            processed_event_id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            event_key: event.event_key.clone(),
            event_id: normalized_event.as_ref().map(|e| e.event_id.clone()),
            event_slug: normalized_event.as_ref().and_then(|e| e.slug.clone()),
            event_title: normalized_event.as_ref().and_then(|e| e.title.clone()),
            raw_snapshot: raw_event,
        })
        .await?;

    let mut processed_markets: HashMap<String, String> = HashMap::new();
    for dumped in &event.markets {
        let market = dumped.to_market(normalized_event.clone());
        let mut input = ProcessedMarketInput::from_market(
            Uuid::new_v4().to_string(),
            run_id,
            &market,
            Some(serde_json::to_value(dumped)?),
            Some(processed_event_id.clone()),
        );
        input.contracts = dumped.processed_contracts();
        let id = session.record_processed_market(&input).await?;
        processed_markets.insert(market.market_id.clone(), id);

        if !skip_market_upsert {
            session.upsert_market(&market).await?;
        }
    }

    // (suite id, research variant) -> artifact id
    let mut registry: HashMap<(String, String), String> = HashMap::new();

    for (suite_id, suite) in &event.suites {
        for (variant_key, entry) in &suite.research {
            let Some(experiment_run_id) = entry.experiment_run_id.as_deref() else {
                warn!(
                    "Missing experiment_run_id for research variant {} in suite {}",
                    variant_key, suite_id
                );
                continue;
            };
            ensure_experiment_run(
                session.as_ref(),
                run_id,
                experiment_run_id,
                entry
                    .experiment_name
                    .clone()
                    .unwrap_or_else(|| experiment_name(suite_id, Stage::Research, &entry.variant)),
                entry.version.clone(),
                Stage::Research,
            )
            .await?;

            let artifact_id = entry
                .artifact_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let payload = enrich_payload(&entry.payload, entry.diagnostics.as_ref(), None);

            session
                .record_research_artifact(&ResearchArtifactInput {
                    artifact_id: artifact_id.clone(),
                    experiment_run_id: experiment_run_id.to_string(),
                    processed_market_id: None,
                    processed_event_id: Some(processed_event_id.clone()),
                    variant_name: entry.variant.clone(),
                    variant_version: entry.version.clone(),
                    artifact_hash: artifact_hash(entry.artifact_hash.as_deref(), payload.as_ref()),
                    payload: payload.clone(),
                    artifact_uri: entry.artifact_uri.clone(),
                })
                .await?;
            session
                .record_experiment_result(&ExperimentResultInput {
                    experiment_run_id: experiment_run_id.to_string(),
                    processed_market_id: None,
                    processed_event_id: Some(processed_event_id.clone()),
                    stage: Stage::Research,
                    variant_name: Some(entry.variant.clone()),
                    variant_version: Some(entry.version.clone()),
                    source_artifact_id: Some(artifact_id.clone()),
                    payload,
                    score: None,
                    artifact_uri: entry.artifact_uri.clone(),
                })
                .await?;

            registry.insert((suite_id.clone(), entry.variant.clone()), artifact_id);
        }

        for (variant_name, forecasts) in &suite.forecasts {
            for (market_id, entry) in forecasts {
                let Some(experiment_run_id) = entry.experiment_run_id.as_deref() else {
                    warn!(
                        "Missing experiment_run_id for forecast variant {} market {}",
                        variant_name, market_id
                    );
                    continue;
                };
                let Some(processed_market_id) = processed_markets.get(market_id) else {
                    warn!("Skipping forecast for market {} (no processed market entry)", market_id);
                    continue;
                };

                let version = entry.version.clone().unwrap_or_else(|| "unknown".to_string());
                ensure_experiment_run(
                    session.as_ref(),
                    run_id,
                    experiment_run_id,
                    entry
                        .experiment_name
                        .clone()
                        .unwrap_or_else(|| experiment_name(suite_id, Stage::Forecast, variant_name)),
                    version.clone(),
                    Stage::Forecast,
                )
                .await?;

                let links: ArtifactLinks = entry
                    .research_artifacts
                    .keys()
                    .filter_map(|dep| {
                        registry
                            .get(&(suite_id.clone(), dep.clone()))
                            .map(|id| (dep.clone(), id.clone()))
                    })
                    .collect();
                let payload = enrich_payload(
                    &forecast_body(&entry.outcome_prices, &entry.reasoning),
                    entry.diagnostics.as_ref(),
                    Some(&links),
                );

                session
                    .record_experiment_result(&ExperimentResultInput {
                        experiment_run_id: experiment_run_id.to_string(),
                        processed_market_id: Some(processed_market_id.clone()),
                        processed_event_id: Some(processed_event_id.clone()),
                        stage: Stage::Forecast,
                        variant_name: Some(variant_name.clone()),
                        variant_version: Some(version),
                        source_artifact_id: primary_artifact(&links),
                        payload,
                        score: entry.score,
                        artifact_uri: entry.artifact_uri.clone(),
                    })
                    .await?;
            }
        }
    }

    session.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use serde_json::json;

    fn write(dir: &Path, suite: &str, name: &str, value: serde_json::Value) {
        let suite_dir = dir.join(suite);
        std::fs::create_dir_all(&suite_dir).unwrap();
        std::fs::write(suite_dir.join(name), value.to_string()).unwrap();
    }

    fn document(suite: &str, event: Option<&str>, market: &str) -> serde_json::Value {
        json!({
            "run_id": "run-1",
            "suite_id": suite,
            "event": event.map(|id| json!({"event_id": id, "title": "Title"})),
            "markets": [{"market_id": market, "question": "q", "contracts": []}],
            "research": {},
            "forecasts": {}
        })
    }

    #[test]
    fn test_load_merges_suites_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a", "e1.json", document("a", Some("e1"), "m1"));
        write(dir.path(), "b", "e1.json", document("b", Some("e1"), "m1"));
        write(dir.path(), "b", "market-m9.json", document("b", None, "m9"));
        write(dir.path(), "b", "broken.json", json!("not a document"));
        std::fs::write(dir.path().join("b").join("notes.txt"), "ignored").unwrap();

        let events = load_run_dumps(dir.path(), &BTreeSet::new()).unwrap();
        let keys: Vec<&str> = events.iter().map(|e| e.event_key.as_str()).collect();
        assert_eq!(keys, vec!["e1", "market:m9"]);
        assert_eq!(events[0].suites.len(), 2);

        let includes: BTreeSet<String> = ["market:m9".to_string()].into_iter().collect();
        let events = load_run_dumps(dir.path(), &includes).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_key, "market:m9");
    }

    #[tokio::test]
    async fn test_missing_run_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = ReplayOptions {
            run_id: "nope".to_string(),
            dump_dir: dir.path().to_path_buf(),
            events: vec![],
            skip_market_upsert: false,
            dry_run: false,
        };
        let err = replay_run(&options, &InMemoryStore::new()).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("run-1"), "a", "e1.json", document("a", Some("e1"), "m1"));
        let store = InMemoryStore::new();
        let options = ReplayOptions {
            run_id: "run-1".to_string(),
            dump_dir: dir.path().to_path_buf(),
            events: vec![],
            skip_market_upsert: false,
            dry_run: true,
        };
        let summary = replay_run(&options, &store).await.unwrap();
        assert_eq!(summary.events_found, 1);
        assert_eq!(summary.events_replayed, 0);
        assert!(store.snapshot().runs.is_empty());
    }

    #[tokio::test]
    async fn test_replay_without_experiment_ids_keeps_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document("a", Some("e1"), "m1");
        doc["research"] = json!({"r1": {"variant": "r1", "version": "1.0", "payload": {"x": 1}}});
        write(&dir.path().join("run-1"), "a", "e1.json", doc);

        let store = InMemoryStore::new();
        let options = ReplayOptions {
            run_id: "run-1".to_string(),
            dump_dir: dir.path().to_path_buf(),
            events: vec![],
            skip_market_upsert: true,
            dry_run: false,
        };
        let summary = replay_run(&options, &store).await.unwrap();
        assert_eq!(summary.events_replayed, 1);

        let state = store.snapshot();
        assert_eq!(state.runs["run-1"].status, "replayed");
        assert_eq!(state.processed_events.len(), 1);
        assert_eq!(state.processed_markets.len(), 1);
        assert!(state.artifacts.is_empty());
        assert!(state.markets.is_empty());
    }
}
