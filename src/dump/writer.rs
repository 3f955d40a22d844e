use crate::domain::EventMarketGroup;
use crate::dump::document::{DumpDocument, DumpEvent, DumpForecast, DumpMarket, DumpResearch};
use crate::error::Result;
use crate::experiments::{ForecastRecord, ResearchRecord};
use crate::pipeline::payloads::{artifact_hash, dependency_artifacts, enrich_payload};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File stem for a group: event id, `market-<first id>`, or `event-unknown`
pub fn dump_file_stem(group: &EventMarketGroup) -> String {
    match group.event.as_ref().filter(|e| !e.event_id.is_empty()) {
        Some(event) => event.event_id.clone(),
        None => match group.markets.first() {
            Some(market) => format!("market-{}", market.market_id),
            None => "event-unknown".to_string(),
        },
    }
}

/// `<base>/<run_id>/<suite_id>/<stem>.json`
pub fn dump_path(base: &Path, run_id: &str, suite_id: &str, group: &EventMarketGroup) -> PathBuf {
    base.join(run_id)
        .join(suite_id)
        .join(format!("{}.json", dump_file_stem(group)))
}

pub fn build_dump_document<'a>(
    run_id: &str,
    suite_id: &str,
    group: &EventMarketGroup,
    suite_research: Option<&BTreeMap<String, ResearchRecord>>,
    forecasts: impl IntoIterator<Item = &'a ForecastRecord>,
) -> DumpDocument {
    let research = suite_research
        .map(|records| {
            records
                .iter()
                .map(|(name, record)| {
                    let output = &record.output;
                    let enriched =
                        enrich_payload(&output.payload, output.diagnostics.as_ref(), None);
                    let entry = DumpResearch {
                        variant: record.strategy_name.clone(),
                        version: record.strategy_version.clone(),
                        artifact_id: Some(record.artifact_id.clone()),
                        artifact_uri: record.output.artifact_uri.clone(),
                        artifact_hash: artifact_hash(output.artifact_hash.as_deref(), enriched.as_ref()),
                        payload: record.output.payload.clone(),
                        diagnostics: record.output.diagnostics.clone(),
                        experiment_run_id: Some(record.experiment_run_id.clone()),
                        experiment_name: Some(record.experiment_name.clone()),
                    };
                    (name.clone(), entry)
                })
                .collect()
        })
        .unwrap_or_default();

    let mut by_variant: BTreeMap<String, BTreeMap<String, DumpForecast>> = BTreeMap::new();
    for record in forecasts {
        let entry = DumpForecast {
            outcome_prices: record.output.outcome_prices.clone(),
            reasoning: record.output.reasoning.clone(),
            experiment_run_id: Some(record.experiment_run_id.clone()),
            experiment_name: Some(record.experiment_name.clone()),
            version: Some(record.strategy_version.clone()),
            score: record.output.score,
            artifact_uri: record.output.artifact_uri.clone(),
            diagnostics: record.output.diagnostics.clone(),
            research_artifacts: dependency_artifacts(&record.dependencies, suite_research),
        };
        by_variant
            .entry(record.strategy_name.clone())
            .or_default()
            .insert(record.output.market_id.clone(), entry);
    }

    DumpDocument {
        run_id: run_id.to_string(),
        suite_id: suite_id.to_string(),
        event: group.event.as_ref().map(DumpEvent::from),
        markets: group.markets.iter().map(DumpMarket::from).collect(),
        research,
        forecasts: by_variant,
    }
}

/// Write one suite's view of a group; returns the file written
pub fn write_group_dump<'a>(
    base: &Path,
    run_id: &str,
    suite_id: &str,
    group: &EventMarketGroup,
    suite_research: Option<&BTreeMap<String, ResearchRecord>>,
    forecasts: impl IntoIterator<Item = &'a ForecastRecord>,
) -> Result<PathBuf> {
    let document = build_dump_document(run_id, suite_id, group, suite_research, forecasts);
    let path = dump_path(base, run_id, suite_id, group);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut text = serde_json::to_string_pretty(&document)?;
    text.push('\n');
    std::fs::write(&path, text)?;
    debug!("Wrote debug dump {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NormalizedEvent, NormalizedMarket};
    use crate::experiments::{ForecastOutput, ResearchOutput};
    use serde_json::json;
    use std::sync::Arc;

    fn group(event: Option<&str>) -> EventMarketGroup {
        let mut market = NormalizedMarket::new("m1", "Will it rain?");
        market.event = event.map(NormalizedEvent::new);
        EventMarketGroup::new(market.event.clone(), vec![market])
    }

    #[test]
    fn test_dump_path_naming() {
        let base = Path::new("/tmp/dumps");
        assert_eq!(
            dump_path(base, "run", "suite", &group(Some("e1"))),
            PathBuf::from("/tmp/dumps/run/suite/e1.json")
        );
        assert_eq!(
            dump_path(base, "run", "suite", &group(None)),
            PathBuf::from("/tmp/dumps/run/suite/market-m1.json")
        );
        assert_eq!(dump_file_stem(&EventMarketGroup::new(None, vec![])), "event-unknown");
    }

    #[test]
    fn test_document_links_forecast_to_research() {
        let research = ResearchRecord {
            suite_id: "s".to_string(),
            strategy_name: "r1".to_string(),
            strategy_version: "1.0".to_string(),
            experiment_name: "s:research:r1".to_string(),
            experiment_run_id: "xr".to_string(),
            output: Arc::new(ResearchOutput::new(json!({"summary": "ok"}))),
            artifact_id: "art-1".to_string(),
            bundle_identity: None,
        };
        let mut records = BTreeMap::new();
        records.insert("r1".to_string(), research);

        let mut prices = BTreeMap::new();
        prices.insert("Yes".to_string(), 0.7);
        let forecast = ForecastRecord {
            suite_id: "s".to_string(),
            strategy_name: "f1".to_string(),
            strategy_version: "2.0".to_string(),
            experiment_name: "s:forecast:f1".to_string(),
            experiment_run_id: "xf".to_string(),
            output: ForecastOutput {
                market_id: "m1".to_string(),
                outcome_prices: prices,
                reasoning: "because".to_string(),
                score: None,
                artifact_uri: None,
                diagnostics: None,
            },
            dependencies: vec!["r1".to_string(), "missing".to_string()],
        };

        let doc = build_dump_document("run", "s", &group(Some("e1")), Some(&records), [&forecast]);
        assert_eq!(doc.research["r1"].artifact_id.as_deref(), Some("art-1"));
        assert_eq!(doc.research["r1"].experiment_run_id.as_deref(), Some("xr"));
        let expected = artifact_hash(None, Some(&json!({"summary": "ok"})));
        assert!(expected.is_some());
        assert_eq!(doc.research["r1"].artifact_hash, expected);
        let entry = &doc.forecasts["f1"]["m1"];
        assert_eq!(entry.research_artifacts.len(), 1);
        assert_eq!(entry.research_artifacts["r1"], "art-1");
        assert_eq!(entry.version.as_deref(), Some("2.0"));

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["forecasts"]["f1"]["m1"]["outcomePrices"]["Yes"], 0.7);
        assert_eq!(value["event"]["event_id"], "e1");
    }

    #[test]
    fn test_write_group_dump_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_group_dump(dir.path(), "run", "baseline", &group(None), None, []).unwrap();
        assert!(path.ends_with("run/baseline/market-m1.json"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with('\n'));
        let doc: DumpDocument = serde_json::from_str(&text).unwrap();
        assert!(doc.forecasts.is_empty());
        assert!(doc.event.is_none());
    }
}
