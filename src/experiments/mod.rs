//! Experiment orchestration: suites of research and forecast strategies, research
//! bundle planning, per-group stage execution, and run metadata tracking.

pub mod builtin;
pub mod bundles;
pub mod catalog;
pub mod executor;
pub mod fingerprint;
pub mod manifest;
pub mod overrides;
pub mod registry;
pub mod run_meta;
pub mod strategy;
pub mod suite;
pub mod testing;

pub use bundles::{plan_research_bundles, BundleKey, ResearchBundle, ResearchBundleMember};
pub use catalog::{StrategyEntry, SuiteCatalog, SuiteDefinition};
pub use executor::{
    ForecastRecord, GroupExecution, ResearchRecord, StageExecutor, StageSelection, SuiteResearch,
};
pub use manifest::{build_manifest, Manifest, ManifestConfiguration};
pub use overrides::ExperimentOverrides;
pub use registry::SuiteRegistry;
pub use run_meta::{ExperimentRunMeta, ExperimentStatus, RunMetadataTracker};
pub use strategy::{
    ForecastOutput, ForecastStrategy, ResearchInputs, ResearchOutput, ResearchStrategy,
    RunContext, Stage, StrategyContext, StrategyError, StrategyInfo, StrategyOutcome,
};
pub use suite::{
    experiment_name, ExperimentSuite, ForecastFactory, ResearchFactory, StrategyDescriptor,
    SuiteBuilder,
};
