//! Per-experiment run metadata: counters and status lifecycle.

use crate::experiments::strategy::Stage;
use crate::experiments::suite::ExperimentSuite;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Experiment run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Running,
    Completed,
    Skipped,
    Failed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Skipped => "skipped",
            ExperimentStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Run metadata of one (suite, stage, strategy) experiment
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRunMeta {
    pub suite_id: String,
    pub stage: Stage,
    pub strategy_name: String,
    pub strategy_version: String,
    pub experiment_name: String,
    pub description: Option<String>,
    /// Stable per-run identifier, persisted as the experiment run id
    pub run_identifier: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExperimentStatus,
    pub error_messages: Vec<String>,
    pub success_count: u32,
    pub skip_count: u32,
    pub failure_count: u32,
}

impl ExperimentRunMeta {
    pub fn new(
        suite_id: impl Into<String>,
        stage: Stage,
        strategy_name: impl Into<String>,
        strategy_version: impl Into<String>,
        experiment_name: impl Into<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            suite_id: suite_id.into(),
            stage,
            strategy_name: strategy_name.into(),
            strategy_version: strategy_version.into(),
            experiment_name: experiment_name.into(),
            description,
            run_identifier: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: ExperimentStatus::Running,
            error_messages: Vec::new(),
            success_count: 0,
            skip_count: 0,
            failure_count: 0,
        }
    }

    /// Failure is terminal for the run's status
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = ExperimentStatus::Failed;
        self.error_messages.push(message.into());
        self.failure_count += 1;
    }

    pub fn mark_completed(&mut self) {
        if self.status == ExperimentStatus::Running {
            self.status = ExperimentStatus::Completed;
        }
    }

    /// Count a skip; the status only becomes `skipped` while nothing has succeeded yet
    pub fn mark_skipped(&mut self, message: &str) {
        self.skip_count += 1;
        if self.status == ExperimentStatus::Failed {
            return;
        }
        if self.success_count == 0 {
            self.status = ExperimentStatus::Skipped;
        }
        self.push_unique(message);
    }

    pub fn record_success(&mut self) {
        if self.status == ExperimentStatus::Failed {
            return;
        }
        if self.status == ExperimentStatus::Skipped {
            self.status = ExperimentStatus::Running;
        }
        self.success_count += 1;
    }

    /// Status recorded when the run is finalized
    pub fn final_status(&self) -> ExperimentStatus {
        match self.status {
            ExperimentStatus::Running => ExperimentStatus::Completed,
            other => other,
        }
    }

    /// Accumulated messages joined for persistence
    pub fn error_summary(&self) -> Option<String> {
        if self.error_messages.is_empty() {
            None
        } else {
            Some(self.error_messages.join("; "))
        }
    }

    fn push_unique(&mut self, message: &str) {
        if !message.is_empty() && !self.error_messages.iter().any(|m| m == message) {
            self.error_messages.push(message.to_string());
        }
    }
}

type MetaKey = (String, Stage, String);

/// Run metadata for every experiment of the selected suites, in declaration order
#[derive(Debug, Clone, Default)]
pub struct RunMetadataTracker {
    metas: Vec<ExperimentRunMeta>,
    index: HashMap<MetaKey, usize>,
}

impl RunMetadataTracker {
    pub fn from_suites(suites: &[ExperimentSuite]) -> Self {
        let mut tracker = Self::default();
        for suite in suites {
            for descriptor in suite.descriptors() {
                tracker.insert(ExperimentRunMeta::new(
                    descriptor.suite_id,
                    descriptor.stage,
                    descriptor.name,
                    descriptor.version,
                    descriptor.experiment_name,
                    descriptor.description,
                ));
            }
        }
        tracker
    }

    pub fn insert(&mut self, meta: ExperimentRunMeta) {
        let key = (meta.suite_id.clone(), meta.stage, meta.strategy_name.clone());
        if let Some(&idx) = self.index.get(&key) {
            self.metas[idx] = meta;
        } else {
            self.index.insert(key, self.metas.len());
            self.metas.push(meta);
        }
    }

    pub fn get(&self, suite_id: &str, stage: Stage, strategy_name: &str) -> Option<&ExperimentRunMeta> {
        self.index
            .get(&(suite_id.to_string(), stage, strategy_name.to_string()))
            .map(|&idx| &self.metas[idx])
    }

    pub fn get_mut(
        &mut self,
        suite_id: &str,
        stage: Stage,
        strategy_name: &str,
    ) -> Option<&mut ExperimentRunMeta> {
        match self
            .index
            .get(&(suite_id.to_string(), stage, strategy_name.to_string()))
        {
            Some(&idx) => Some(&mut self.metas[idx]),
            None => None,
        }
    }

    pub fn metas(&self) -> &[ExperimentRunMeta] {
        &self.metas
    }

    /// Stamp `finished_at` and move running experiments to completed
    pub fn finalize(&mut self, finished_at: DateTime<Utc>) {
        for meta in &mut self.metas {
            meta.finished_at = Some(finished_at);
            meta.mark_completed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ExperimentRunMeta {
        ExperimentRunMeta::new("s", Stage::Research, "r1", "1.0", "s:research:r1", None)
    }

    #[test]
    fn test_skip_then_success_returns_to_running() {
        let mut m = meta();
        m.mark_skipped("no key");
        assert_eq!(m.status, ExperimentStatus::Skipped);
        m.record_success();
        assert_eq!(m.status, ExperimentStatus::Running);
        assert_eq!(m.success_count, 1);
        assert_eq!(m.skip_count, 1);
        assert_eq!(m.final_status(), ExperimentStatus::Completed);
    }

    #[test]
    fn test_skip_after_success_keeps_status() {
        let mut m = meta();
        m.record_success();
        m.mark_skipped("filtered");
        m.mark_skipped("filtered");
        assert_eq!(m.status, ExperimentStatus::Running);
        assert_eq!(m.skip_count, 2);
        assert_eq!(m.error_messages, vec!["filtered".to_string()]);
    }

    #[test]
    fn test_failure_is_sticky() {
        let mut m = meta();
        m.mark_failed("boom");
        m.record_success();
        m.mark_skipped("later");
        m.mark_completed();
        assert_eq!(m.status, ExperimentStatus::Failed);
        assert_eq!(m.success_count, 0);
        assert_eq!(m.skip_count, 1);
        assert_eq!(m.failure_count, 1);
        assert_eq!(m.error_summary().as_deref(), Some("boom"));
    }

    #[test]
    fn test_tracker_lookup_and_finalize() {
        let mut tracker = RunMetadataTracker::default();
        tracker.insert(meta());
        tracker.insert(ExperimentRunMeta::new(
            "s",
            Stage::Forecast,
            "f1",
            "1.0",
            "s:forecast:f1",
            None,
        ));
        tracker
            .get_mut("s", Stage::Forecast, "f1")
            .unwrap()
            .mark_skipped("missing research dependencies: r1");

        let now = Utc::now();
        tracker.finalize(now);
        let research = tracker.get("s", Stage::Research, "r1").unwrap();
        assert_eq!(research.status, ExperimentStatus::Completed);
        assert_eq!(research.finished_at, Some(now));
        let forecast = tracker.get("s", Stage::Forecast, "f1").unwrap();
        assert_eq!(forecast.status, ExperimentStatus::Skipped);
        assert!(tracker.get("s", Stage::Research, "missing").is_none());
    }
}
