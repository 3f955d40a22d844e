//! In-memory store for tests and local dry runs.
//!
//! Sessions work on a private copy of the state and publish it on `commit`, so a
//! session dropped without committing leaves the store untouched.

use crate::domain::{NormalizedEvent, NormalizedMarket};
use crate::error::{PipelineError, Result};
use crate::persistence::models::{
    EventResolution, ExperimentResultInput, ExperimentRunInput, MarketRecord,
    MarketResolutionUpdate, ProcessedEventInput, ProcessedMarketInput, ProcessingFailureInput,
    ProcessingRunInput, ResearchArtifactInput, RunFinalization, RunStatus, UnresolvedQuery,
};
use crate::persistence::repository::{
    MarketRepository, PipelineSession, ProcessingRepository, SessionFactory,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRun {
    /// `None` for placeholder rows created by replay
    pub input: Option<ProcessingRunInput>,
    pub status: String,
    pub finalization: Option<RunFinalization>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMarket {
    /// Latest snapshot with `event` stripped
    pub market: NormalizedMarket,
    pub event_id: Option<String>,
    pub last_synced_at: DateTime<Utc>,
}

impl StoredMarket {
    pub fn record(&self) -> MarketRecord {
        let m = &self.market;
        MarketRecord {
            market_id: m.market_id.clone(),
            event_id: self.event_id.clone(),
            status: m.status.clone(),
            close_time: m.close_time,
            is_resolved: m.is_resolved.unwrap_or(false),
            resolved_at: m.resolved_at,
            resolution_source: m.resolution_source.clone(),
            winning_outcome: m.winning_outcome.clone(),
            payout_token: m.payout_token.clone(),
            resolution_tx_hash: m.resolution_tx_hash.clone(),
            resolution_notes: m.resolution_notes.clone(),
            last_synced_at: Some(self.last_synced_at),
        }
    }
}

/// Every table of the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryState {
    pub runs: BTreeMap<String, StoredRun>,
    /// Keyed by `(run_id, event_key)`
    pub processed_events: BTreeMap<(String, String), ProcessedEventInput>,
    /// Keyed by `(run_id, market_id)`
    pub processed_markets: BTreeMap<(String, String), ProcessedMarketInput>,
    pub failures: Vec<ProcessingFailureInput>,
    pub experiment_runs: BTreeMap<String, ExperimentRunInput>,
    pub artifacts: BTreeMap<String, ResearchArtifactInput>,
    /// Keyed by `ExperimentResultInput::result_key`
    pub results: BTreeMap<String, ExperimentResultInput>,
    pub markets: BTreeMap<String, StoredMarket>,
    pub events: BTreeMap<String, NormalizedEvent>,
}

impl MemoryState {
    fn require_run(&self, run_id: &str) -> Result<()> {
        if self.runs.contains_key(run_id) {
            Ok(())
        } else {
            Err(PipelineError::Repository(format!(
                "processing run {run_id} does not exist"
            )))
        }
    }

    fn require_experiment_run(&self, experiment_run_id: &str) -> Result<()> {
        if self.experiment_runs.contains_key(experiment_run_id) {
            Ok(())
        } else {
            Err(PipelineError::Repository(format!(
                "experiment run {experiment_run_id} does not exist"
            )))
        }
    }

    fn upsert_event(&mut self, event: &NormalizedEvent) {
        match self.events.get_mut(&event.event_id) {
            Some(existing) => {
                let is_resolved = event.is_resolved.or(existing.is_resolved);
                let resolved_at = event.resolved_at.or(existing.resolved_at);
                let source = event
                    .resolution_source
                    .clone()
                    .or_else(|| existing.resolution_source.take());
                *existing = event.clone();
                existing.is_resolved = is_resolved;
                existing.resolved_at = resolved_at;
                existing.resolution_source = source;
            }
            None => {
                self.events.insert(event.event_id.clone(), event.clone());
            }
        }
    }

    fn upsert_market(&mut self, market: &NormalizedMarket) {
        let event_id = market.event_id().map(str::to_string);
        if let Some(event) = market.event.as_ref().filter(|e| !e.event_id.is_empty()) {
            self.upsert_event(event);
        }

        let mut snapshot = market.clone();
        snapshot.event = None;
        match self.markets.get_mut(&market.market_id) {
            Some(stored) => {
                let previous = std::mem::replace(&mut stored.market, snapshot);
                let m = &mut stored.market;
                m.is_resolved = m.is_resolved.or(previous.is_resolved);
                m.resolved_at = m.resolved_at.or(previous.resolved_at);
                m.resolution_source = m.resolution_source.take().or(previous.resolution_source);
                m.winning_outcome = m.winning_outcome.take().or(previous.winning_outcome);
                m.payout_token = m.payout_token.take().or(previous.payout_token);
                m.resolution_tx_hash = m.resolution_tx_hash.take().or(previous.resolution_tx_hash);
                m.resolution_notes = m.resolution_notes.take().or(previous.resolution_notes);
                stored.event_id = event_id;
            }
            None => {
                self.markets.insert(
                    market.market_id.clone(),
                    StoredMarket {
                        market: snapshot,
                        event_id,
                        last_synced_at: Utc::now(),
                    },
                );
            }
        }
    }
}

/// Shared in-memory store; cloning shares the same state
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed state
    pub fn snapshot(&self) -> MemoryState {
        lock(&self.state).clone()
    }

    /// Replace the committed state (test fixtures)
    pub fn seed(&self, state: MemoryState) {
        *lock(&self.state) = state;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SessionFactory for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn PipelineSession>> {
        let staged = self.snapshot();
        Ok(Box::new(InMemorySession {
            store: Arc::clone(&self.state),
            staged: Mutex::new(Some(staged)),
        }))
    }
}

pub struct InMemorySession {
    store: Arc<Mutex<MemoryState>>,
    staged: Mutex<Option<MemoryState>>,
}

impl InMemorySession {
    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T>) -> Result<T> {
        let mut guard = lock(&self.staged);
        let state = guard
            .as_mut()
            .ok_or_else(|| PipelineError::Repository("session already committed".to_string()))?;
        f(state)
    }
}

#[async_trait]
impl ProcessingRepository for InMemorySession {
    async fn create_processing_run(&self, run: &ProcessingRunInput) -> Result<()> {
        self.with_state(|state| {
            state.runs.insert(
                run.run_id.clone(),
                StoredRun {
                    input: Some(run.clone()),
                    status: RunStatus::Running.as_str().to_string(),
                    finalization: None,
                },
            );
            Ok(())
        })
    }

    async fn ensure_processing_run(&self, run_id: &str) -> Result<()> {
        self.with_state(|state| {
            state.runs.entry(run_id.to_string()).or_insert_with(|| StoredRun {
                input: None,
                status: "replayed".to_string(),
                finalization: None,
            });
            Ok(())
        })
    }

    async fn finalize_processing_run(&self, run_id: &str, finalization: &RunFinalization) -> Result<()> {
        self.with_state(|state| {
            let run = state.runs.get_mut(run_id).ok_or_else(|| {
                PipelineError::Repository(format!("processing run {run_id} does not exist"))
            })?;
            run.status = finalization.status.as_str().to_string();
            run.finalization = Some(finalization.clone());
            Ok(())
        })
    }

    async fn record_processed_event(&self, input: &ProcessedEventInput) -> Result<String> {
        self.with_state(|state| {
            state.require_run(&input.run_id)?;
            let key = (input.run_id.clone(), input.event_key.clone());
            let id = match state.processed_events.get_mut(&key) {
                Some(existing) => {
                    let id = existing.processed_event_id.clone();
                    *existing = ProcessedEventInput {
                        processed_event_id: id.clone(),
                        ..input.clone()
                    };
                    id
                }
                None => {
                    state.processed_events.insert(key, input.clone());
                    input.processed_event_id.clone()
                }
            };
            Ok(id)
        })
    }

    async fn record_processed_market(&self, input: &ProcessedMarketInput) -> Result<String> {
        self.with_state(|state| {
            state.require_run(&input.run_id)?;
            let key = (input.run_id.clone(), input.market_id.clone());
            let id = state
                .processed_markets
                .get(&key)
                .map(|existing| existing.processed_market_id.clone())
                .unwrap_or_else(|| input.processed_market_id.clone());
            state.processed_markets.insert(
                key,
                ProcessedMarketInput {
                    processed_market_id: id.clone(),
                    ..input.clone()
                },
            );
            Ok(id)
        })
    }

    async fn record_processing_failure(&self, input: &ProcessingFailureInput) -> Result<()> {
        self.with_state(|state| {
            state.require_run(&input.run_id)?;
            state.failures.push(input.clone());
            Ok(())
        })
    }

    async fn record_experiment_run(&self, input: &ExperimentRunInput) -> Result<()> {
        self.with_state(|state| {
            state.require_run(&input.run_id)?;
            state
                .experiment_runs
                .insert(input.experiment_run_id.clone(), input.clone());
            Ok(())
        })
    }

    async fn ensure_experiment_run(&self, input: &ExperimentRunInput) -> Result<()> {
        self.with_state(|state| {
            state.require_run(&input.run_id)?;
            state
                .experiment_runs
                .entry(input.experiment_run_id.clone())
                .or_insert_with(|| input.clone());
            Ok(())
        })
    }

    async fn record_research_artifact(&self, input: &ResearchArtifactInput) -> Result<()> {
        self.with_state(|state| {
            state.require_experiment_run(&input.experiment_run_id)?;
            state.artifacts.insert(input.artifact_id.clone(), input.clone());
            Ok(())
        })
    }

    async fn record_experiment_result(&self, input: &ExperimentResultInput) -> Result<()> {
        self.with_state(|state| {
            state.require_experiment_run(&input.experiment_run_id)?;
            if let Some(artifact_id) = &input.source_artifact_id {
                if !state.artifacts.contains_key(artifact_id) {
                    return Err(PipelineError::Repository(format!(
                        "research artifact {artifact_id} does not exist"
                    )));
                }
            }
            state.results.insert(input.result_key(), input.clone());
            Ok(())
        })
    }
}

#[async_trait]
impl MarketRepository for InMemorySession {
    async fn upsert_market(&self, market: &NormalizedMarket) -> Result<()> {
        self.with_state(|state| {
            state.upsert_market(market);
            Ok(())
        })
    }

    async fn upsert_event(&self, event: &NormalizedEvent) -> Result<()> {
        self.with_state(|state| {
            state.upsert_event(event);
            Ok(())
        })
    }

    async fn fetch_unresolved_markets(&self, query: &UnresolvedQuery) -> Result<Vec<MarketRecord>> {
        self.with_state(|state| {
            let mut records: Vec<MarketRecord> = state
                .markets
                .values()
                .map(StoredMarket::record)
                .filter(|r| !r.is_resolved)
                .filter(|r| {
                    query.event_ids.is_empty()
                        || r.event_id
                            .as_ref()
                            .map_or(false, |id| query.event_ids.contains(id))
                })
                .filter(|r| match (query.recent_cutoff, r.last_synced_at) {
                    (Some(cutoff), Some(synced)) => synced >= cutoff,
                    (Some(_), None) => false,
                    (None, _) => true,
                })
                .collect();
            records.sort_by(|a, b| match (a.close_time, b.close_time) {
                (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.market_id.cmp(&b.market_id)),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.market_id.cmp(&b.market_id),
            });
            if let Some(limit) = query.limit.filter(|l| *l > 0) {
                records.truncate(limit as usize);
            }
            Ok(records)
        })
    }

    async fn mark_market_synced(&self, market_id: &str, synced_at: DateTime<Utc>) -> Result<()> {
        self.with_state(|state| {
            if let Some(stored) = state.markets.get_mut(market_id) {
                stored.last_synced_at = synced_at;
            }
            Ok(())
        })
    }

    async fn apply_market_resolution(&self, update: &MarketResolutionUpdate) -> Result<bool> {
        self.with_state(|state| {
            let stored = state.markets.get_mut(&update.market_id).ok_or_else(|| {
                PipelineError::Repository(format!("market {} does not exist", update.market_id))
            })?;
            let mut record = stored.record();
            let changed = record.apply_resolution(update);

            let m = &mut stored.market;
            m.is_resolved = Some(record.is_resolved);
            m.status = record.status;
            m.resolved_at = record.resolved_at;
            m.resolution_source = record.resolution_source;
            m.winning_outcome = record.winning_outcome;
            m.payout_token = record.payout_token;
            m.resolution_tx_hash = record.resolution_tx_hash;
            m.resolution_notes = record.resolution_notes;
            stored.last_synced_at = update.checked_at;
            Ok(changed)
        })
    }

    async fn refresh_event_resolution(&self, event_id: &str) -> Result<Option<EventResolution>> {
        self.with_state(|state| {
            if !state.events.contains_key(event_id) {
                return Ok(None);
            }
            let markets: Vec<MarketRecord> = state
                .markets
                .values()
                .filter(|m| m.event_id.as_deref() == Some(event_id))
                .map(StoredMarket::record)
                .collect();
            let resolution = EventResolution::from_markets(event_id, &markets);
            if let Some(event) = state.events.get_mut(event_id) {
                event.is_resolved = Some(resolution.is_resolved);
                event.resolved_at = resolution.resolved_at;
                event.resolution_source = resolution.resolution_source.clone();
            }
            Ok(Some(resolution))
        })
    }
}

#[async_trait]
impl PipelineSession for InMemorySession {
    async fn commit(&self) -> Result<()> {
        let staged = lock(&self.staged).take().ok_or_else(|| {
            PipelineError::Repository("session already committed".to_string())
        })?;
        *lock(&self.store) = staged;
        debug!("In-memory session committed");
        Ok(())
    }
}
