//! Persistence for processing runs, experiment outputs, and the market catalogue.
//!
//! - `repository`: the session and repository contracts used by the pipeline
//! - `postgres`: PostgreSQL-backed sessions, one transaction per session
//! - `memory`: in-memory store with the same commit semantics

pub mod memory;
pub mod models;
pub mod postgres;
pub mod repository;

pub use memory::{InMemoryStore, MemoryState};
pub use models::{
    EventResolution, ExperimentResultInput, ExperimentRunInput, MarketRecord,
    MarketResolutionUpdate, ProcessedContractInput, ProcessedEventInput, ProcessedMarketInput,
    ProcessingFailureInput, ProcessingRunInput, ResearchArtifactInput, RunFinalization,
    RunStatus, UnresolvedQuery,
};
pub use postgres::PostgresStore;
pub use repository::{MarketRepository, PipelineSession, ProcessingRepository, SessionFactory};
