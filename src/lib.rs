pub mod cli;
pub mod config;
pub mod domain;
pub mod dump;
pub mod error;
pub mod experiments;
pub mod ingestion;
pub mod llm;
pub mod persistence;
pub mod pipeline;
pub mod resolution;

pub use config::AppConfig;
pub use error::{PipelineError, Result};
pub use experiments::{ExperimentSuite, Stage, StageExecutor, StageSelection, SuiteRegistry};
pub use persistence::{InMemoryStore, PostgresStore};
pub use pipeline::{PipelineRunner, PipelineSummary, RunOptions};
pub use resolution::{ResolutionSummary, ResolutionSweep};
