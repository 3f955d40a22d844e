//! Payload shaping shared by the pipeline run and dump replay.

use crate::experiments::fingerprint::canonical_hash;
use crate::experiments::{ForecastOutput, ResearchRecord};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Research name to artifact id for the dependencies a forecast declared
pub type ArtifactLinks = BTreeMap<String, String>;

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// Attach `_diagnostics` and `_research_artifacts` without overwriting keys the
/// payload already carries. `None` when there is nothing to store.
pub fn enrich_payload(
    payload: &Value,
    diagnostics: Option<&Value>,
    references: Option<&ArtifactLinks>,
) -> Option<Value> {
    let references = references.filter(|r| !r.is_empty());
    if payload.is_null() && is_empty(diagnostics) && references.is_none() {
        return None;
    }

    let mut data = match payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    if let Some(diagnostics) = diagnostics.filter(|d| !is_empty(Some(d))) {
        data.entry("_diagnostics").or_insert_with(|| diagnostics.clone());
    }
    if let Some(references) = references {
        data.entry("_research_artifacts")
            .or_insert_with(|| json!(references));
    }
    Some(Value::Object(data))
}

/// Content hash of a stored payload
pub fn artifact_hash(declared: Option<&str>, payload: Option<&Value>) -> Option<String> {
    declared
        .map(str::to_string)
        .or_else(|| payload.map(canonical_hash))
}

/// Artifact ids of the declared dependencies found in the suite's research
pub fn dependency_artifacts(
    dependencies: &[String],
    suite_research: Option<&BTreeMap<String, ResearchRecord>>,
) -> ArtifactLinks {
    let Some(research) = suite_research else {
        return ArtifactLinks::new();
    };
    dependencies
        .iter()
        .filter_map(|dep| {
            research
                .get(dep)
                .map(|record| (dep.clone(), record.artifact_id.clone()))
        })
        .collect()
}

/// The source artifact of a forecast result: only set for a single dependency
pub fn primary_artifact(links: &ArtifactLinks) -> Option<String> {
    if links.len() == 1 {
        links.values().next().cloned()
    } else {
        None
    }
}

/// `{"outcomePrices", "reasoning"}` as stored for forecast results
pub fn forecast_body(outcome_prices: &BTreeMap<String, f64>, reasoning: &str) -> Value {
    json!({
        "outcomePrices": outcome_prices,
        "reasoning": reasoning,
    })
}

pub fn forecast_payload(output: &ForecastOutput, links: &ArtifactLinks) -> Option<Value> {
    enrich_payload(
        &forecast_body(&output.outcome_prices, &output.reasoning),
        output.diagnostics.as_ref(),
        Some(links),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrich_keeps_existing_keys() {
        let payload = json!({"summary": "x", "_diagnostics": {"mine": true}});
        let enriched = enrich_payload(&payload, Some(&json!({"model": "m"})), None).unwrap();
        assert_eq!(enriched["_diagnostics"], json!({"mine": true}));
        assert_eq!(enriched["summary"], "x");
    }

    #[test]
    fn test_enrich_null_payload() {
        assert_eq!(enrich_payload(&Value::Null, None, None), None);
        assert_eq!(enrich_payload(&Value::Null, Some(&json!({})), None), None);

        let mut links = ArtifactLinks::new();
        links.insert("r1".to_string(), "a1".to_string());
        let enriched = enrich_payload(&Value::Null, None, Some(&links)).unwrap();
        assert_eq!(enriched, json!({"_research_artifacts": {"r1": "a1"}}));
    }

    #[test]
    fn test_primary_artifact_requires_single_link() {
        let mut links = ArtifactLinks::new();
        assert_eq!(primary_artifact(&links), None);
        links.insert("r1".to_string(), "a1".to_string());
        assert_eq!(primary_artifact(&links).as_deref(), Some("a1"));
        links.insert("r2".to_string(), "a2".to_string());
        assert_eq!(primary_artifact(&links), None);
    }

    #[test]
    fn test_artifact_hash_prefers_declared() {
        let payload = json!({"a": 1});
        assert_eq!(artifact_hash(Some("abc"), Some(&payload)).as_deref(), Some("abc"));
        assert_eq!(
            artifact_hash(None, Some(&payload)),
            Some(canonical_hash(&payload))
        );
        assert_eq!(artifact_hash(None, None), None);
    }
}
