//! Row inputs and query results exchanged with the repositories.

use crate::domain::{NormalizedContract, NormalizedMarket};
use crate::experiments::Stage;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Value};

/// Processing run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithErrors,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
        }
    }

    pub fn from_failures(failed_markets: usize) -> Self {
        if failed_markets == 0 {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRunInput {
    pub run_id: String,
    pub run_date: NaiveDate,
    pub window_days: i64,
    pub target_date: NaiveDate,
    pub git_sha: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunFinalization {
    pub status: RunStatus,
    pub total_markets: usize,
    pub processed_markets: usize,
    pub failed_markets: usize,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedContractInput {
    pub contract_id: String,
    pub name: String,
    pub price: Option<f64>,
    pub attributes: Value,
}

impl From<&NormalizedContract> for ProcessedContractInput {
    fn from(contract: &NormalizedContract) -> Self {
        Self {
            contract_id: contract.contract_id.clone(),
            name: contract.name.clone(),
            price: contract.current_price,
            attributes: json!({
                "outcome_type": contract.outcome_type,
                "confidence": contract.confidence,
                "implied_probability": contract.implied_probability,
                "raw_data": contract.raw_data,
            }),
        }
    }
}

/// Snapshot of an event as seen by one run; unique per `(run_id, event_key)`
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEventInput {
    pub processed_event_id: String,
    pub run_id: String,
    pub event_key: String,
    pub event_id: Option<String>,
    pub event_slug: Option<String>,
    pub event_title: Option<String>,
    pub raw_snapshot: Option<Value>,
}

/// Snapshot of a market as seen by one run; unique per `(run_id, market_id)`
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedMarketInput {
    pub processed_market_id: String,
    pub run_id: String,
    pub market_id: String,
    pub market_slug: Option<String>,
    pub question: String,
    pub close_time: Option<DateTime<Utc>>,
    pub raw_snapshot: Option<Value>,
    pub processed_event_id: Option<String>,
    pub contracts: Vec<ProcessedContractInput>,
}

impl ProcessedMarketInput {
    pub fn from_market(
        processed_market_id: impl Into<String>,
        run_id: impl Into<String>,
        market: &NormalizedMarket,
        raw_snapshot: Option<Value>,
        processed_event_id: Option<String>,
    ) -> Self {
        Self {
            processed_market_id: processed_market_id.into(),
            run_id: run_id.into(),
            market_id: market.market_id.clone(),
            market_slug: market.slug.clone(),
            question: market.question.clone(),
            close_time: market.close_time,
            raw_snapshot,
            processed_event_id,
            contracts: market.contracts.iter().map(ProcessedContractInput::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingFailureInput {
    pub run_id: String,
    pub market_id: Option<String>,
    pub reason: String,
    pub retriable: bool,
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRunInput {
    pub experiment_run_id: String,
    pub run_id: String,
    pub experiment_name: String,
    pub experiment_version: String,
    pub description: Option<String>,
    pub stage: Stage,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResearchArtifactInput {
    pub artifact_id: String,
    pub experiment_run_id: String,
    pub processed_market_id: Option<String>,
    pub processed_event_id: Option<String>,
    pub variant_name: String,
    pub variant_version: String,
    pub artifact_hash: Option<String>,
    pub payload: Option<Value>,
    pub artifact_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentResultInput {
    pub experiment_run_id: String,
    pub processed_market_id: Option<String>,
    pub processed_event_id: Option<String>,
    pub stage: Stage,
    pub variant_name: Option<String>,
    pub variant_version: Option<String>,
    pub source_artifact_id: Option<String>,
    pub payload: Option<Value>,
    pub score: Option<f64>,
    pub artifact_uri: Option<String>,
}

impl ExperimentResultInput {
    /// Upsert key: `{experiment_run_id}:{processed_event_id}:{processed_market_id}`, `-` for absent parts
    pub fn result_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.experiment_run_id,
            self.processed_event_id.as_deref().unwrap_or("-"),
            self.processed_market_id.as_deref().unwrap_or("-")
        )
    }
}

/// Stored market fields read by the resolution sweep
#[derive(Debug, Clone, PartialEq)]
pub struct MarketRecord {
    pub market_id: String,
    pub event_id: Option<String>,
    pub status: String,
    pub close_time: Option<DateTime<Utc>>,
    pub is_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_source: Option<String>,
    pub winning_outcome: Option<String>,
    pub payout_token: Option<String>,
    pub resolution_tx_hash: Option<String>,
    pub resolution_notes: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl MarketRecord {
    /// Mark resolved and copy every non-null field of `update`; resolution fields
    /// are never cleared. True when a resolution field changed.
    pub fn apply_resolution(&mut self, update: &MarketResolutionUpdate) -> bool {
        let mut changed = false;
        if !self.is_resolved {
            self.is_resolved = true;
            changed = true;
        }
        if self.status != "resolved" {
            self.status = "resolved".to_string();
            changed = true;
        }
        changed |= merge(&mut self.resolved_at, update.resolved_at);
        changed |= merge(&mut self.resolution_source, update.resolution_source.clone());
        changed |= merge(&mut self.winning_outcome, update.winning_outcome.clone());
        changed |= merge(&mut self.payout_token, update.payout_token.clone());
        changed |= merge(&mut self.resolution_tx_hash, update.resolution_tx_hash.clone());
        changed |= merge(&mut self.resolution_notes, update.resolution_notes.clone());
        self.last_synced_at = Some(update.checked_at);
        changed
    }
}

fn merge<T: PartialEq>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match value {
        Some(v) if slot.as_ref() != Some(&v) => {
            *slot = Some(v);
            true
        }
        _ => false,
    }
}

/// Candidate filter for `fetch_unresolved_markets`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnresolvedQuery {
    pub limit: Option<i64>,
    pub event_ids: Vec<String>,
    pub recent_cutoff: Option<DateTime<Utc>>,
}

/// Upstream resolution state applied to a stored market
#[derive(Debug, Clone, PartialEq)]
pub struct MarketResolutionUpdate {
    pub market_id: String,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_source: Option<String>,
    pub winning_outcome: Option<String>,
    pub payout_token: Option<String>,
    pub resolution_tx_hash: Option<String>,
    pub resolution_notes: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl MarketResolutionUpdate {
    pub fn from_market(market: &NormalizedMarket, checked_at: DateTime<Utc>) -> Self {
        Self {
            market_id: market.market_id.clone(),
            resolved_at: market.resolved_at,
            resolution_source: market.resolution_source.clone(),
            winning_outcome: market.winning_outcome.clone(),
            payout_token: market.payout_token.clone(),
            resolution_tx_hash: market.resolution_tx_hash.clone(),
            resolution_notes: market.resolution_notes.clone(),
            checked_at,
        }
    }
}

/// Event resolution recomputed from its markets
#[derive(Debug, Clone, PartialEq)]
pub struct EventResolution {
    pub event_id: String,
    pub is_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_source: Option<String>,
}

impl EventResolution {
    /// Resolved iff every market is; latest market timestamp; most common source
    /// (first seen wins ties)
    pub fn from_markets(event_id: impl Into<String>, markets: &[MarketRecord]) -> Self {
        let event_id = event_id.into();
        if markets.is_empty() || markets.iter().any(|m| !m.is_resolved) {
            return Self {
                event_id,
                is_resolved: false,
                resolved_at: None,
                resolution_source: None,
            };
        }

        let resolved_at = markets.iter().filter_map(|m| m.resolved_at).max();
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for source in markets.iter().filter_map(|m| m.resolution_source.as_deref()) {
            match counts.iter_mut().find(|(s, _)| *s == source) {
                Some(entry) => entry.1 += 1,
                None => counts.push((source, 1)),
            }
        }
        let mut best: Option<(&str, usize)> = None;
        for (source, count) in counts {
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((source, count));
            }
        }

        Self {
            event_id,
            is_resolved: true,
            resolved_at,
            resolution_source: best.map(|(s, _)| s.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, resolved: bool, hour: Option<u32>, source: Option<&str>) -> MarketRecord {
        MarketRecord {
            market_id: id.to_string(),
            event_id: Some("e1".to_string()),
            status: "open".to_string(),
            close_time: None,
            is_resolved: resolved,
            resolved_at: hour.map(|h| Utc.with_ymd_and_hms(2025, 1, 1, h, 0, 0).unwrap()),
            resolution_source: source.map(str::to_string),
            winning_outcome: None,
            payout_token: None,
            resolution_tx_hash: None,
            resolution_notes: None,
            last_synced_at: None,
        }
    }

    #[test]
    fn test_event_resolution_requires_all_markets() {
        let markets = vec![record("a", true, Some(3), Some("uma")), record("b", false, None, None)];
        let resolution = EventResolution::from_markets("e1", &markets);
        assert!(!resolution.is_resolved);
        assert!(resolution.resolved_at.is_none());
        assert!(!EventResolution::from_markets("e1", &[]).is_resolved);
    }

    #[test]
    fn test_event_resolution_latest_time_and_common_source() {
        let markets = vec![
            record("a", true, Some(3), Some("oracle")),
            record("b", true, Some(9), Some("uma")),
            record("c", true, None, Some("uma")),
        ];
        let resolution = EventResolution::from_markets("e1", &markets);
        assert!(resolution.is_resolved);
        assert_eq!(resolution.resolved_at.unwrap().format("%H").to_string(), "09");
        assert_eq!(resolution.resolution_source.as_deref(), Some("uma"));

        let tie = vec![
            record("a", true, Some(1), Some("oracle")),
            record("b", true, Some(2), Some("uma")),
        ];
        let resolution = EventResolution::from_markets("e1", &tie);
        assert_eq!(resolution.resolution_source.as_deref(), Some("oracle"));
    }

    #[test]
    fn test_apply_resolution_is_monotonic() {
        let mut market = record("a", false, None, Some("uma"));
        let update = MarketResolutionUpdate {
            market_id: "a".to_string(),
            resolved_at: Some(Utc.with_ymd_and_hms(2025, 1, 1, 5, 0, 0).unwrap()),
            resolution_source: None,
            winning_outcome: Some("Yes".to_string()),
            payout_token: None,
            resolution_tx_hash: None,
            resolution_notes: None,
            checked_at: Utc::now(),
        };
        assert!(market.apply_resolution(&update));
        assert!(market.is_resolved);
        assert_eq!(market.status, "resolved");
        assert_eq!(market.resolution_source.as_deref(), Some("uma"));
        assert_eq!(market.winning_outcome.as_deref(), Some("Yes"));
        assert!(!market.apply_resolution(&update));
    }

    #[test]
    fn test_result_key() {
        let input = ExperimentResultInput {
            experiment_run_id: "x".to_string(),
            processed_market_id: None,
            processed_event_id: Some("pe".to_string()),
            stage: Stage::Research,
            variant_name: None,
            variant_version: None,
            source_artifact_id: None,
            payload: None,
            score: None,
            artifact_uri: None,
        };
        assert_eq!(input.result_key(), "x:pe:-");
        assert_eq!(RunStatus::from_failures(2).as_str(), "completed_with_errors");
    }
}
