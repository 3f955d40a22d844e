//! Run summary document.

use crate::error::Result;
use crate::experiments::{ExperimentRunMeta, Stage};
use crate::persistence::RunStatus;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub completed: u32,
    pub skipped: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteStats {
    pub research: StageStats,
    pub forecast: StageStats,
}

impl SuiteStats {
    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageStats {
        match stage {
            Stage::Research => &mut self.research,
            Stage::Forecast => &mut self.forecast,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub market_id: String,
    pub reason: String,
}

/// Aggregate counters of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub run_id: String,
    pub run_date: NaiveDate,
    pub target_date: NaiveDate,
    pub window_days: i64,
    pub total_markets: usize,
    pub processed_markets: usize,
    pub failed_markets: usize,
    pub failures: Vec<FailureEntry>,
    /// Success counts are charged to every suite consuming a shared bundle
    pub suite_stats: BTreeMap<String, SuiteStats>,
    /// Research strategy invocations that actually ran
    pub distinct_research_executions: usize,
    /// Suite attachments served by a shared invocation instead of running again
    pub shared_research_reuses: usize,
}

impl PipelineSummary {
    pub fn new(run_id: impl Into<String>, run_date: NaiveDate, target_date: NaiveDate, window_days: i64) -> Self {
        Self {
            run_id: run_id.into(),
            run_date,
            target_date,
            window_days,
            total_markets: 0,
            processed_markets: 0,
            failed_markets: 0,
            failures: Vec::new(),
            suite_stats: BTreeMap::new(),
            distinct_research_executions: 0,
            shared_research_reuses: 0,
        }
    }

    pub fn record_failure(&mut self, market_id: impl Into<String>, reason: impl Into<String>) {
        self.failed_markets += 1;
        self.failures.push(FailureEntry {
            market_id: market_id.into(),
            reason: reason.into(),
        });
    }

    pub fn record_experiment_meta(&mut self, meta: &ExperimentRunMeta) {
        let stats = self
            .suite_stats
            .entry(meta.suite_id.clone())
            .or_default()
            .stage_mut(meta.stage);
        stats.completed += meta.success_count;
        stats.skipped += meta.skip_count;
        stats.failed += meta.failure_count;
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::from_failures(self.failed_markets)
    }
}

/// Write a report as pretty JSON with sorted keys and a trailing newline
pub fn write_json_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    // Value maps are ordered, so converting first sorts every object's keys
    let value = serde_json::to_value(report)?;
    let mut text = serde_json::to_string_pretty(&value)?;
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}
