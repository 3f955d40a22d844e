//! TOML suite definitions and the default suites.
//!
//! ```toml
//! default_suites = ["openai"]
//!
//! [[suites]]
//! suite_id = "openai"
//! version = "0.2"
//!
//! [[suites.research]]
//! kind = "llm_web_search"
//!
//! [[suites.forecasts]]
//! kind = "llm_forecast"
//! alias = "gpt41_forecast"
//! requires = ["llm_web_search"]
//! overrides = { model = "gpt-4.1" }
//! ```

use crate::config::Overrides;
use crate::error::{PipelineError, SuiteError};
use crate::experiments::builtin::{
    forecast_factory, reads_all_research, research_factory, ATLAS_RESEARCH_SWEEP, GEMINI_FORECAST,
    GEMINI_WEB_SEARCH, HORIZON_SIGNAL_TIMELINE, LLM_FORECAST, LLM_WEB_SEARCH, MARKET_IMPLIED,
    SUPERFORECASTER_BRIEFING, SUPERFORECASTER_DELPHI,
};
use crate::experiments::strategy::Stage;
use crate::experiments::suite::{ExperimentSuite, StrategyFactory};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuiteCatalog {
    /// Suites run when none are requested; empty means every suite
    #[serde(default)]
    pub default_suites: Vec<String>,
    #[serde(default)]
    pub suites: Vec<SuiteDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuiteDefinition {
    pub suite_id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub research: Vec<StrategyEntry>,
    #[serde(default)]
    pub forecasts: Vec<StrategyEntry>,
}

/// One strategy of a suite, referenced by catalogue kind
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyEntry {
    pub kind: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Forecast only; research names within the same suite
    #[serde(default)]
    pub requires: Option<Vec<String>>,
    #[serde(default)]
    pub overrides: Overrides,
}

impl StrategyEntry {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            alias: None,
            version: None,
            description: None,
            requires: None,
            overrides: Overrides::new(),
        }
    }

    fn apply<S: ?Sized>(&self, mut factory: StrategyFactory<S>) -> StrategyFactory<S> {
        if let Some(alias) = &self.alias {
            factory = factory.alias(alias.clone());
        }
        if let Some(version) = &self.version {
            factory = factory.version(version.clone());
        }
        if let Some(description) = &self.description {
            factory = factory.description(description.clone());
        }
        factory.overrides(self.overrides.clone())
    }

    fn research_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(self.kind.as_str())
    }
}

impl SuiteCatalog {
    pub fn from_toml_str(content: &str) -> Result<Self, PipelineError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Registered suites; `baseline` and `openai` run unless others are requested
    pub fn builtin() -> Self {
        let mut gpt41 = StrategyEntry::new(LLM_FORECAST);
        gpt41.alias = Some("gpt41_forecast".to_string());
        gpt41.version = Some("0.2-gpt4.1".to_string());
        gpt41.description = Some("JSON-mode forecast prompt using GPT-4.1 preview".to_string());
        gpt41.requires = Some(vec![LLM_WEB_SEARCH.to_string()]);
        gpt41.overrides.insert("model".to_string(), "gpt-4.1".into());

        let mut gemini = StrategyEntry::new(GEMINI_FORECAST);
        gemini.requires = Some(vec![GEMINI_WEB_SEARCH.to_string()]);

        Self {
            default_suites: vec!["baseline".to_string(), "openai".to_string()],
            suites: vec![
                SuiteDefinition {
                    suite_id: "baseline".to_string(),
                    version: Some("1.0".to_string()),
                    description: Some("Market-implied probabilities without research".to_string()),
                    research: Vec::new(),
                    forecasts: vec![StrategyEntry::new(MARKET_IMPLIED)],
                },
                SuiteDefinition {
                    suite_id: "openai".to_string(),
                    version: Some("0.2".to_string()),
                    description: Some("LLM web-search research feeding an LLM forecast".to_string()),
                    research: vec![
                        StrategyEntry::new(LLM_WEB_SEARCH),
                        StrategyEntry::new(ATLAS_RESEARCH_SWEEP),
                        StrategyEntry::new(HORIZON_SIGNAL_TIMELINE),
                    ],
                    forecasts: vec![gpt41],
                },
                SuiteDefinition {
                    suite_id: "gemini".to_string(),
                    version: Some("0.1".to_string()),
                    description: Some(
                        "Gemini-backed research and forecast flow grounded with Google Search".to_string(),
                    ),
                    research: vec![StrategyEntry::new(GEMINI_WEB_SEARCH)],
                    forecasts: vec![gemini],
                },
                SuiteDefinition {
                    suite_id: "superforecaster".to_string(),
                    version: Some("0.1".to_string()),
                    description: Some(
                        "Superforecaster-style research brief with calibrated probability aggregation"
                            .to_string(),
                    ),
                    research: vec![
                        StrategyEntry::new(LLM_WEB_SEARCH),
                        StrategyEntry::new(SUPERFORECASTER_BRIEFING),
                    ],
                    forecasts: vec![StrategyEntry::new(SUPERFORECASTER_DELPHI)],
                },
            ],
        }
    }
}

impl SuiteDefinition {
    pub fn build(&self) -> Result<ExperimentSuite, SuiteError> {
        let mut builder = ExperimentSuite::builder(&self.suite_id);
        if let Some(version) = &self.version {
            builder = builder.version(version.clone());
        }
        if let Some(description) = &self.description {
            builder = builder.description(description.clone());
        }

        for entry in &self.research {
            if entry.requires.is_some() {
                return Err(SuiteError::InvalidStrategy {
                    suite_id: self.suite_id.clone(),
                    reason: format!("research strategy '{}' cannot declare requires", entry.kind),
                });
            }
            let factory = research_factory(&entry.kind).ok_or_else(|| SuiteError::UnknownKind {
                suite_id: self.suite_id.clone(),
                stage: Stage::Research.to_string(),
                kind: entry.kind.clone(),
            })?;
            builder = builder.research(entry.apply(factory));
        }

        for entry in &self.forecasts {
            let requires = match &entry.requires {
                Some(requires) => requires.clone(),
                // LLM forecasts read every research artifact of the suite unless told otherwise
                None if reads_all_research(&entry.kind) => self
                    .research
                    .iter()
                    .map(|r| r.research_name().to_string())
                    .collect(),
                None => Vec::new(),
            };
            if reads_all_research(&entry.kind) && requires.is_empty() {
                return Err(SuiteError::InvalidStrategy {
                    suite_id: self.suite_id.clone(),
                    reason: format!("{} requires at least one research dependency", entry.kind),
                });
            }
            let factory = forecast_factory(&entry.kind, requires).ok_or_else(|| SuiteError::UnknownKind {
                suite_id: self.suite_id.clone(),
                stage: Stage::Forecast.to_string(),
                kind: entry.kind.clone(),
            })?;
            builder = builder.forecast(entry.apply(factory));
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_suites_build() {
        let suites: Vec<ExperimentSuite> = SuiteCatalog::builtin()
            .suites
            .iter()
            .map(|d| d.build().unwrap())
            .collect();
        let ids: Vec<&str> = suites.iter().map(|s| s.suite_id()).collect();
        assert_eq!(ids, vec!["baseline", "openai", "gemini", "superforecaster"]);
        assert!(suites[0].research().is_empty());
        assert!(suites[0].forecasts()[0].requires.is_empty());

        let openai = &suites[1];
        let research: Vec<&str> = openai.research().iter().map(|r| r.identity.name.as_str()).collect();
        assert_eq!(research, vec![LLM_WEB_SEARCH, ATLAS_RESEARCH_SWEEP, HORIZON_SIGNAL_TIMELINE]);
        let forecast = &openai.forecasts()[0];
        assert_eq!(forecast.identity.name, "gpt41_forecast");
        assert_eq!(forecast.identity.version, "0.2-gpt4.1");
        assert_eq!(forecast.requires, vec![LLM_WEB_SEARCH.to_string()]);
        assert_eq!(forecast.overrides.get("model"), Some(&json!("gpt-4.1")));

        assert_eq!(suites[2].forecasts()[0].requires, vec![GEMINI_WEB_SEARCH.to_string()]);
        assert_eq!(
            suites[3].forecasts()[0].requires,
            vec![SUPERFORECASTER_BRIEFING.to_string()]
        );
    }

    #[test]
    fn test_web_search_is_shareable_between_openai_and_superforecaster() {
        let catalog = SuiteCatalog::builtin();
        let shared: Vec<Option<String>> = ["openai", "superforecaster"]
            .iter()
            .map(|id| {
                let definition = catalog.suites.iter().find(|d| d.suite_id == *id).unwrap();
                let suite = definition.build().unwrap();
                let slot = suite
                    .research()
                    .iter()
                    .find(|r| r.identity.name == LLM_WEB_SEARCH)
                    .unwrap();
                slot.identity.shared_identity.clone()
            })
            .collect();
        assert_eq!(shared[0].as_deref(), Some("catalog:llm_web_search:v0.2"));
        assert_eq!(shared[0], shared[1]);
        assert_eq!(catalog.default_suites, vec!["baseline", "openai"]);
    }

    #[test]
    fn test_toml_catalogue_with_alias_and_overrides() {
        let catalog = SuiteCatalog::from_toml_str(
            r#"
[[suites]]
suite_id = "gemini"
version = "0.3"

[[suites.research]]
kind = "llm_web_search"
alias = "search"
overrides = { provider = "gemini", temperature = 0.2 }

[[suites.forecasts]]
kind = "llm_forecast"
"#,
        )
        .unwrap();
        let suite = catalog.suites[0].build().unwrap();
        assert_eq!(suite.version(), "0.3");
        assert_eq!(suite.research()[0].identity.name, "search");
        assert_eq!(suite.forecasts()[0].requires, vec!["search".to_string()]);

        let declared = suite.declared_overrides();
        assert_eq!(declared[0].0, "gemini:research:search");
        assert_eq!(declared[0].1.get("provider"), Some(&json!("gemini")));
    }

    #[test]
    fn test_invalid_definitions_are_rejected() {
        let unknown = SuiteDefinition {
            suite_id: "x".to_string(),
            version: None,
            description: None,
            research: vec![StrategyEntry::new("crystal_ball")],
            forecasts: Vec::new(),
        };
        assert!(matches!(unknown.build(), Err(SuiteError::UnknownKind { .. })));

        let mut forecast = StrategyEntry::new(MARKET_IMPLIED);
        forecast.requires = Some(vec!["missing".to_string()]);
        let dangling = SuiteDefinition {
            suite_id: "y".to_string(),
            version: None,
            description: None,
            research: Vec::new(),
            forecasts: vec![forecast],
        };
        assert!(matches!(
            dangling.build(),
            Err(SuiteError::MissingDependencies { .. })
        ));

        let lonely = SuiteDefinition {
            suite_id: "z".to_string(),
            version: None,
            description: None,
            research: Vec::new(),
            forecasts: vec![StrategyEntry::new(LLM_FORECAST)],
        };
        assert!(matches!(lonely.build(), Err(SuiteError::InvalidStrategy { .. })));
    }
}
