//! Daily forecasting pipeline.

pub mod grouping;
pub mod payloads;
pub mod run;
pub mod summary;

pub use grouping::{group_markets, GroupBuilder};
pub use run::{PipelineRunner, RunOptions};
pub use summary::{write_json_report, FailureEntry, PipelineSummary, StageStats, SuiteStats};
