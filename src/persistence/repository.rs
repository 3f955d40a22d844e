//! Repository contract consumed by the pipeline, replay and resolution sweep.

use crate::domain::{NormalizedEvent, NormalizedMarket};
use crate::error::Result;
use crate::persistence::models::{
    EventResolution, ExperimentResultInput, ExperimentRunInput, MarketRecord,
    MarketResolutionUpdate, ProcessedEventInput, ProcessedMarketInput, ProcessingFailureInput,
    ProcessingRunInput, ResearchArtifactInput, RunFinalization, UnresolvedQuery,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Processing runs and everything recorded while processing one
#[async_trait]
pub trait ProcessingRepository: Send + Sync {
    async fn create_processing_run(&self, run: &ProcessingRunInput) -> Result<()>;

    /// Insert a placeholder run row when `run_id` is unknown (replay into a fresh store)
    async fn ensure_processing_run(&self, run_id: &str) -> Result<()>;

    async fn finalize_processing_run(&self, run_id: &str, finalization: &RunFinalization) -> Result<()>;

    /// Upsert per `(run_id, event_key)`; returns the stored processed event id
    async fn record_processed_event(&self, input: &ProcessedEventInput) -> Result<String>;

    /// Upsert per `(run_id, market_id)` and replace its contracts; returns the stored id
    async fn record_processed_market(&self, input: &ProcessedMarketInput) -> Result<String>;

    async fn record_processing_failure(&self, input: &ProcessingFailureInput) -> Result<()>;

    /// Upsert per experiment run id
    async fn record_experiment_run(&self, input: &ExperimentRunInput) -> Result<()>;

    /// Insert the experiment run only when it does not exist yet
    async fn ensure_experiment_run(&self, input: &ExperimentRunInput) -> Result<()>;

    /// Upsert per artifact id
    async fn record_research_artifact(&self, input: &ResearchArtifactInput) -> Result<()>;

    /// Upsert per `ExperimentResultInput::result_key`
    async fn record_experiment_result(&self, input: &ExperimentResultInput) -> Result<()>;
}

/// Current market and event rows
#[async_trait]
pub trait MarketRepository: Send + Sync {
    /// Resolution fields are only overwritten by non-null values
    async fn upsert_market(&self, market: &NormalizedMarket) -> Result<()>;

    async fn upsert_event(&self, event: &NormalizedEvent) -> Result<()>;

    /// Unresolved markets ordered by close time (nulls last), then market id
    async fn fetch_unresolved_markets(&self, query: &UnresolvedQuery) -> Result<Vec<MarketRecord>>;

    async fn mark_market_synced(&self, market_id: &str, synced_at: DateTime<Utc>) -> Result<()>;

    /// Mark the market resolved with any non-null fields of `update`; true when a
    /// resolution field changed
    async fn apply_market_resolution(&self, update: &MarketResolutionUpdate) -> Result<bool>;

    /// Recompute an event's resolution from its markets; `None` for unknown events
    async fn refresh_event_resolution(&self, event_id: &str) -> Result<Option<EventResolution>>;
}

/// One unit of work; dropped without `commit` means rolled back
#[async_trait]
pub trait PipelineSession: ProcessingRepository + MarketRepository {
    async fn commit(&self) -> Result<()>;
}

/// Opens sessions against a store
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn PipelineSession>>;
}
