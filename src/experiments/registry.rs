//! Ordered suite builders and suite selection for a run.

use crate::config::AppConfig;
use crate::error::{PipelineError, SuiteError};
use crate::experiments::catalog::SuiteCatalog;
use crate::experiments::suite::ExperimentSuite;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Builds a fresh suite; called once per run
pub type SuiteBuilderFn = Arc<dyn Fn() -> Result<ExperimentSuite, SuiteError> + Send + Sync>;

/// Suites available to the pipeline, in registration order
#[derive(Clone, Default)]
pub struct SuiteRegistry {
    builders: Vec<(String, SuiteBuilderFn)>,
    defaults: Vec<String>,
}

impl std::fmt::Debug for SuiteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuiteRegistry")
            .field("suites", &self.ids())
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl SuiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_catalog(catalog: SuiteCatalog) -> Self {
        let mut registry = Self::new();
        registry.set_defaults(catalog.default_suites);
        for definition in catalog.suites {
            let id = definition.suite_id.clone();
            registry.register(id, move || definition.build());
        }
        registry
    }

    /// Catalogue file from `suites_file` when configured, else the built-in suites
    pub fn from_config(config: &AppConfig) -> Result<Self, PipelineError> {
        let catalog = match &config.suites_file {
            Some(path) => {
                info!("Loading suite catalogue from {}", path.display());
                SuiteCatalog::from_path(path)?
            }
            None => SuiteCatalog::builtin(),
        };
        Ok(Self::from_catalog(catalog))
    }

    /// Register a builder; an existing id is replaced in place
    pub fn register<F>(&mut self, suite_id: impl Into<String>, builder: F)
    where
        F: Fn() -> Result<ExperimentSuite, SuiteError> + Send + Sync + 'static,
    {
        let suite_id = suite_id.into();
        let builder: SuiteBuilderFn = Arc::new(builder);
        match self.builders.iter_mut().find(|(id, _)| *id == suite_id) {
            Some(slot) => slot.1 = builder,
            None => self.builders.push((suite_id, builder)),
        }
    }

    /// Suites selected when a run requests none; empty selects every suite
    pub fn set_defaults<I, S>(&mut self, suite_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.defaults = suite_ids.into_iter().map(Into::into).collect();
    }

    pub fn ids(&self) -> Vec<&str> {
        self.builders.iter().map(|(id, _)| id.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// Build every registered suite
    pub fn instantiate(&self) -> Result<Vec<ExperimentSuite>, SuiteError> {
        if self.builders.is_empty() {
            return Err(SuiteError::EmptyRegistry);
        }
        self.builders.iter().map(|(_, build)| build()).collect()
    }

    /// Build the suites, keeping only `requested` ids, or the defaults when none are given
    pub fn load(&self, requested: &[String]) -> Result<Vec<ExperimentSuite>, SuiteError> {
        let suites = self.instantiate()?;
        let mut allowed: BTreeSet<&str> = requested
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .collect();
        if allowed.is_empty() {
            allowed = self.defaults.iter().map(|id| id.trim()).filter(|id| !id.is_empty()).collect();
        }
        if allowed.is_empty() {
            return Ok(suites);
        }

        let filtered: Vec<ExperimentSuite> = suites
            .into_iter()
            .filter(|suite| allowed.contains(suite.suite_id()))
            .collect();
        let missing: Vec<&str> = allowed
            .iter()
            .copied()
            .filter(|id| !filtered.iter().any(|s| s.suite_id() == *id))
            .collect();
        if !missing.is_empty() {
            warn!("Requested suite IDs not found in registry: {}", missing.join(", "));
        }
        if filtered.is_empty() {
            return Err(SuiteError::NoneSelected);
        }
        Ok(filtered)
    }
}
