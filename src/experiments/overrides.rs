use crate::config::Overrides;
use std::collections::HashMap;

/// Per-experiment override lookup for one run.
///
/// Two layers: overrides declared by the suite definition (strategy factory) and the
/// `experiments."<name>"` tables from configuration. Configuration wins per key.
#[derive(Debug, Clone, Default)]
pub struct ExperimentOverrides {
    configured: HashMap<String, Overrides>,
    declared: HashMap<String, Overrides>,
}

impl ExperimentOverrides {
    pub fn new(configured: HashMap<String, Overrides>) -> Self {
        Self {
            configured,
            declared: HashMap::new(),
        }
    }

    /// Register suite-declared overrides for an experiment
    pub fn declare(&mut self, experiment_name: impl Into<String>, overrides: Overrides) {
        if overrides.is_empty() {
            return;
        }
        self.declared
            .entry(experiment_name.into())
            .or_default()
            .extend(overrides);
    }

    /// Effective override mapping (empty when nothing is configured)
    pub fn get(&self, experiment_name: &str) -> Overrides {
        let mut merged = self
            .declared
            .get(experiment_name)
            .cloned()
            .unwrap_or_default();
        if let Some(configured) = self.configured.get(experiment_name) {
            for (key, value) in configured {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(pairs: &[(&str, serde_json::Value)]) -> Overrides {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_configured_wins_per_key() {
        let mut configured = HashMap::new();
        configured.insert(
            "openai:research:llm_web_search".to_string(),
            table(&[("model", json!("gpt-4.1"))]),
        );
        let mut overrides = ExperimentOverrides::new(configured);
        overrides.declare(
            "openai:research:llm_web_search",
            table(&[("model", json!("gpt-4o")), ("temperature", json!(0.1))]),
        );

        let merged = overrides.get("openai:research:llm_web_search");
        assert_eq!(merged.get("model"), Some(&json!("gpt-4.1")));
        assert_eq!(merged.get("temperature"), Some(&json!(0.1)));
        assert!(overrides.get("baseline:forecast:market_implied").is_empty());
    }
}
