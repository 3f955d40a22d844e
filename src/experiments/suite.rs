//! Suites: named sets of research and forecast strategies with suite-scoped naming.

use crate::config::Overrides;
use crate::error::SuiteError;
use crate::experiments::strategy::{ForecastStrategy, ResearchStrategy, Stage, StrategyInfo};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Resolved identity of a strategy inside a suite, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyIdentity {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    #[serde(skip)]
    pub shared_identity: Option<String>,
}

/// Deferred constructor plus the suite-level identity adjustments for one strategy
pub struct StrategyFactory<S: ?Sized> {
    constructor: Arc<dyn Fn() -> Arc<S> + Send + Sync>,
    alias: Option<String>,
    version: Option<String>,
    description: Option<String>,
    overrides: Overrides,
    requires: Option<Vec<String>>,
}

pub type ResearchFactory = StrategyFactory<dyn ResearchStrategy>;
pub type ForecastFactory = StrategyFactory<dyn ForecastStrategy>;

impl<S: ?Sized> Clone for StrategyFactory<S> {
    fn clone(&self) -> Self {
        Self {
            constructor: Arc::clone(&self.constructor),
            alias: self.alias.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            overrides: self.overrides.clone(),
            requires: self.requires.clone(),
        }
    }
}

impl<S: ?Sized> StrategyFactory<S> {
    fn from_constructor(constructor: Arc<dyn Fn() -> Arc<S> + Send + Sync>) -> Self {
        Self {
            constructor,
            alias: None,
            version: None,
            description: None,
            overrides: Overrides::new(),
            requires: None,
        }
    }

    /// Report the strategy under a different name within the suite
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Overrides declared by the suite; configuration tables still win per key
    pub fn overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    fn identity(&self, info: StrategyInfo) -> StrategyIdentity {
        StrategyIdentity {
            name: self.alias.clone().unwrap_or(info.name),
            version: self.version.clone().unwrap_or(info.version),
            description: self.description.clone().or(info.description),
            shared_identity: info.shared_identity.filter(|s| !s.is_empty()),
        }
    }
}

impl ResearchFactory {
    pub fn research<T, F>(build: F) -> Self
    where
        T: ResearchStrategy + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::from_constructor(Arc::new(move || Arc::new(build()) as Arc<dyn ResearchStrategy>))
    }
}

impl ForecastFactory {
    pub fn forecast<T, F>(build: F) -> Self
    where
        T: ForecastStrategy + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::from_constructor(Arc::new(move || Arc::new(build()) as Arc<dyn ForecastStrategy>))
    }

    /// Replace the strategy's own dependency list
    pub fn requires<I, N>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.requires = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

/// Constructed research strategy
#[derive(Clone)]
pub struct ResearchSlot {
    pub identity: StrategyIdentity,
    pub overrides: Overrides,
    pub strategy: Arc<dyn ResearchStrategy>,
}

/// Constructed forecast strategy with its resolved dependencies
#[derive(Clone)]
pub struct ForecastSlot {
    pub identity: StrategyIdentity,
    pub requires: Vec<String>,
    pub overrides: Overrides,
    pub strategy: Arc<dyn ForecastStrategy>,
}

/// Identity of one (suite, stage, strategy) experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyDescriptor {
    pub suite_id: String,
    pub stage: Stage,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub experiment_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires: Option<Vec<String>>,
}

/// A validated suite; strategies are built once per suite per run
#[derive(Clone)]
pub struct ExperimentSuite {
    suite_id: String,
    version: String,
    description: Option<String>,
    research: Vec<ResearchSlot>,
    forecasts: Vec<ForecastSlot>,
}

impl std::fmt::Debug for ExperimentSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentSuite")
            .field("suite_id", &self.suite_id)
            .field("version", &self.version)
            .field(
                "research",
                &self.research.iter().map(|s| &s.identity.name).collect::<Vec<_>>(),
            )
            .field(
                "forecasts",
                &self.forecasts.iter().map(|s| &s.identity.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// `suite_id:stage:strategy_name`
pub fn experiment_name(suite_id: &str, stage: Stage, strategy_name: &str) -> String {
    format!("{suite_id}:{}:{strategy_name}", stage.as_str())
}

impl ExperimentSuite {
    pub fn builder(suite_id: impl Into<String>) -> SuiteBuilder {
        SuiteBuilder::new(suite_id)
    }

    pub fn suite_id(&self) -> &str {
        &self.suite_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn research(&self) -> &[ResearchSlot] {
        &self.research
    }

    pub fn forecasts(&self) -> &[ForecastSlot] {
        &self.forecasts
    }

    pub fn experiment_name(&self, stage: Stage, strategy_name: &str) -> String {
        experiment_name(&self.suite_id, stage, strategy_name)
    }

    /// Research first, then forecasts, each in declaration order
    pub fn descriptors(&self) -> Vec<StrategyDescriptor> {
        let research = self.research.iter().map(|slot| StrategyDescriptor {
            suite_id: self.suite_id.clone(),
            stage: Stage::Research,
            name: slot.identity.name.clone(),
            version: slot.identity.version.clone(),
            description: slot.identity.description.clone(),
            experiment_name: self.experiment_name(Stage::Research, &slot.identity.name),
            requires: None,
        });
        let forecasts = self.forecasts.iter().map(|slot| StrategyDescriptor {
            suite_id: self.suite_id.clone(),
            stage: Stage::Forecast,
            name: slot.identity.name.clone(),
            version: slot.identity.version.clone(),
            description: slot.identity.description.clone(),
            experiment_name: self.experiment_name(Stage::Forecast, &slot.identity.name),
            requires: Some(slot.requires.clone()),
        });
        research.chain(forecasts).collect()
    }

    /// Suite-declared overrides keyed by experiment name
    pub fn declared_overrides(&self) -> Vec<(String, Overrides)> {
        let research = self.research.iter().map(|slot| {
            (
                self.experiment_name(Stage::Research, &slot.identity.name),
                slot.overrides.clone(),
            )
        });
        let forecasts = self.forecasts.iter().map(|slot| {
            (
                self.experiment_name(Stage::Forecast, &slot.identity.name),
                slot.overrides.clone(),
            )
        });
        research
            .chain(forecasts)
            .filter(|(_, overrides)| !overrides.is_empty())
            .collect()
    }
}

/// Collects factories and validates the resulting suite
pub struct SuiteBuilder {
    suite_id: String,
    version: String,
    description: Option<String>,
    research: Vec<ResearchFactory>,
    forecasts: Vec<ForecastFactory>,
}

impl SuiteBuilder {
    pub fn new(suite_id: impl Into<String>) -> Self {
        Self {
            suite_id: suite_id.into(),
            version: "1.0".to_string(),
            description: None,
            research: Vec::new(),
            forecasts: Vec::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn research(mut self, factory: ResearchFactory) -> Self {
        self.research.push(factory);
        self
    }

    pub fn forecast(mut self, factory: ForecastFactory) -> Self {
        self.forecasts.push(factory);
        self
    }

    /// Instantiate every strategy and validate names and dependencies
    pub fn build(self) -> Result<ExperimentSuite, SuiteError> {
        let research: Vec<ResearchSlot> = self
            .research
            .iter()
            .map(|factory| {
                let strategy = (factory.constructor)();
                ResearchSlot {
                    identity: factory.identity(strategy.info()),
                    overrides: factory.overrides.clone(),
                    strategy,
                }
            })
            .collect();

        let forecasts: Vec<ForecastSlot> = self
            .forecasts
            .iter()
            .map(|factory| {
                let strategy = (factory.constructor)();
                let requires = factory
                    .requires
                    .clone()
                    .unwrap_or_else(|| strategy.requires());
                ForecastSlot {
                    identity: factory.identity(strategy.info()),
                    requires,
                    overrides: factory.overrides.clone(),
                    strategy,
                }
            })
            .collect();

        let mut research_names = HashSet::new();
        for slot in &research {
            if !research_names.insert(slot.identity.name.as_str()) {
                return Err(SuiteError::DuplicateResearch {
                    suite_id: self.suite_id.clone(),
                    name: slot.identity.name.clone(),
                });
            }
        }

        let mut forecast_names = HashSet::new();
        for slot in &forecasts {
            if !forecast_names.insert(slot.identity.name.as_str()) {
                return Err(SuiteError::DuplicateForecast {
                    suite_id: self.suite_id.clone(),
                    name: slot.identity.name.clone(),
                });
            }
            let missing: Vec<&str> = slot
                .requires
                .iter()
                .map(String::as_str)
                .filter(|name| !research_names.contains(name))
                .collect();
            if !missing.is_empty() {
                return Err(SuiteError::MissingDependencies {
                    suite_id: self.suite_id.clone(),
                    forecast: slot.identity.name.clone(),
                    missing: missing.join(", "),
                });
            }
        }

        Ok(ExperimentSuite {
            suite_id: self.suite_id,
            version: self.version,
            description: self.description,
            research,
            forecasts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiments::testing::{StaticForecast, StaticResearch};

    #[test]
    fn test_alias_and_version_override_identity() {
        let suite = ExperimentSuite::builder("alpha")
            .research(
                ResearchFactory::research(|| StaticResearch::new("snapshot"))
                    .alias("snap")
                    .version("2.0"),
            )
            .forecast(ForecastFactory::forecast(|| StaticForecast::new("fc", &["snap"])))
            .build()
            .unwrap();

        let slot = &suite.research()[0];
        assert_eq!(slot.identity.name, "snap");
        assert_eq!(slot.identity.version, "2.0");
        assert_eq!(
            suite.experiment_name(Stage::Research, "snap"),
            "alpha:research:snap"
        );

        let descriptors = suite.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[1].experiment_name, "alpha:forecast:fc");
        assert_eq!(descriptors[1].requires, Some(vec!["snap".to_string()]));
    }

    #[test]
    fn test_duplicate_research_rejected() {
        let err = ExperimentSuite::builder("alpha")
            .research(ResearchFactory::research(|| StaticResearch::new("r1")))
            .research(ResearchFactory::research(|| StaticResearch::new("r1")))
            .build()
            .unwrap_err();
        assert!(matches!(err, SuiteError::DuplicateResearch { ref name, .. } if name == "r1"));
    }

    #[test]
    fn test_duplicate_forecast_rejected() {
        let err = ExperimentSuite::builder("alpha")
            .forecast(ForecastFactory::forecast(|| StaticForecast::new("f", &[])))
            .forecast(ForecastFactory::forecast(|| StaticForecast::new("f", &[])))
            .build()
            .unwrap_err();
        assert!(matches!(err, SuiteError::DuplicateForecast { .. }));
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let err = ExperimentSuite::builder("alpha")
            .research(ResearchFactory::research(|| StaticResearch::new("r1")))
            .forecast(ForecastFactory::forecast(|| {
                StaticForecast::new("f", &["r1", "r2", "r3"])
            }))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SuiteError::MissingDependencies {
                suite_id: "alpha".to_string(),
                forecast: "f".to_string(),
                missing: "r2, r3".to_string(),
            }
        );
    }

    #[test]
    fn test_factory_requires_replaces_strategy_default() {
        let suite = ExperimentSuite::builder("alpha")
            .forecast(
                ForecastFactory::forecast(|| StaticForecast::new("f", &["absent"])).requires(
                    Vec::<String>::new(),
                ),
            )
            .build()
            .unwrap();
        assert!(suite.forecasts()[0].requires.is_empty());
    }

    #[test]
    fn test_declared_overrides_skip_empty() {
        let mut overrides = Overrides::new();
        overrides.insert("model".to_string(), serde_json::json!("m"));
        let suite = ExperimentSuite::builder("alpha")
            .research(ResearchFactory::research(|| StaticResearch::new("r1")).overrides(overrides))
            .research(ResearchFactory::research(|| StaticResearch::new("r2")))
            .build()
            .unwrap();
        let declared = suite.declared_overrides();
        assert_eq!(declared.len(), 1);
        assert_eq!(declared[0].0, "alpha:research:r1");
    }
}
