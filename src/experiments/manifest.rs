//! Experiment manifest printed by `run --list-experiments`.

use crate::experiments::executor::StageSelection;
use crate::experiments::strategy::Stage;
use crate::experiments::suite::{ExperimentSuite, StrategyDescriptor};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub generated_at: String,
    pub suite_count: usize,
    pub suites: Vec<SuiteManifest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ManifestConfiguration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteManifest {
    pub suite_id: String,
    pub version: String,
    pub description: Option<String>,
    pub stages: StageManifests,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageManifests {
    pub research: StageManifest,
    pub forecast: StageManifest,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageManifest {
    pub active: bool,
    pub variants: Vec<VariantManifest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantManifest {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub experiment_name: String,
    pub selected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires: Option<Vec<String>>,
}

/// CLI selection echoed back with the manifest
#[derive(Debug, Clone, Serialize)]
pub struct ManifestConfiguration {
    pub stage: String,
    pub suite_filter: Vec<String>,
    pub include_research: Option<Vec<String>>,
    pub include_forecast: Option<Vec<String>>,
}

impl ManifestConfiguration {
    pub fn new(stage: impl Into<String>, suite_filter: &[String], selection: &StageSelection) -> Self {
        Self {
            stage: stage.into(),
            suite_filter: suite_filter.to_vec(),
            include_research: selection
                .include_research
                .as_ref()
                .map(|set| set.iter().cloned().collect()),
            include_forecast: selection
                .include_forecast
                .as_ref()
                .map(|set| set.iter().cloned().collect()),
        }
    }
}

fn variant(descriptor: StrategyDescriptor, selection: &StageSelection) -> VariantManifest {
    let selected = selection.is_active(descriptor.stage)
        && selection.variant_selected(descriptor.stage, &descriptor.suite_id, &descriptor.name);
    VariantManifest {
        name: descriptor.name,
        version: descriptor.version,
        description: descriptor.description,
        experiment_name: descriptor.experiment_name,
        selected,
        requires: descriptor.requires,
    }
}

fn suite_manifest(suite: &ExperimentSuite, selection: &StageSelection) -> SuiteManifest {
    let mut research = Vec::new();
    let mut forecast = Vec::new();
    for descriptor in suite.descriptors() {
        match descriptor.stage {
            Stage::Research => research.push(variant(descriptor, selection)),
            Stage::Forecast => forecast.push(variant(descriptor, selection)),
        }
    }
    SuiteManifest {
        suite_id: suite.suite_id().to_string(),
        version: suite.version().to_string(),
        description: suite.description().map(str::to_string),
        stages: StageManifests {
            research: StageManifest {
                active: selection.is_active(Stage::Research),
                variants: research,
            },
            forecast: StageManifest {
                active: selection.is_active(Stage::Forecast),
                variants: forecast,
            },
        },
    }
}

pub fn build_manifest(
    suites: &[ExperimentSuite],
    selection: &StageSelection,
    generated_at: DateTime<Utc>,
) -> Manifest {
    Manifest {
        generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        suite_count: suites.len(),
        suites: suites.iter().map(|s| suite_manifest(s, selection)).collect(),
        configuration: None,
    }
}
