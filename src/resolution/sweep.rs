//! Resolution reconciliation sweep.
//!
//! Walks unresolved markets, re-fetches each from the upstream catalogue, and
//! records resolutions. Event resolution is recomputed from its markets once every
//! candidate has been checked. A market that cannot be fetched is reported and
//! left untouched.

use crate::config::AppConfig;
use crate::domain::{normalize_market, NormalizedMarket};
use crate::error::Result;
use crate::ingestion::MarketSource;
use crate::persistence::{
    MarketRecord, MarketResolutionUpdate, PipelineSession, SessionFactory, UnresolvedQuery,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

const UNAVAILABLE: &str = "resolution data unavailable";

#[derive(Debug, Clone, Default)]
pub struct ResolutionOptions {
    /// Maximum candidates to check
    pub limit: Option<i64>,
    /// Overrides the configured chunk size
    pub batch_size: Option<i64>,
    /// Restrict to these events, in addition to the configured forced ids
    pub event_ids: Vec<String>,
    /// Only markets synced within the last `recent_hours`
    pub recent_hours: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionFailure {
    pub market_id: String,
    pub reason: String,
}

/// Counters of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionSummary {
    pub checked_markets: usize,
    pub newly_resolved: usize,
    pub already_resolved: usize,
    pub still_open: usize,
    pub updated_events: usize,
    pub failures: Vec<ResolutionFailure>,
}

impl ResolutionSummary {
    fn record_failure(&mut self, market_id: &str, reason: impl Into<String>) {
        self.failures.push(ResolutionFailure {
            market_id: market_id.to_string(),
            reason: reason.into(),
        });
    }
}

pub struct ResolutionSweep<'a> {
    config: &'a AppConfig,
    source: &'a dyn MarketSource,
    sessions: &'a dyn SessionFactory,
}

impl<'a> ResolutionSweep<'a> {
    pub fn new(
        config: &'a AppConfig,
        source: &'a dyn MarketSource,
        sessions: &'a dyn SessionFactory,
    ) -> Self {
        Self {
            config,
            source,
            sessions,
        }
    }

    fn query(&self, options: &ResolutionOptions) -> UnresolvedQuery {
        let event_ids: BTreeSet<String> = options
            .event_ids
            .iter()
            .chain(self.config.resolution.force_event_ids.iter())
            .filter(|id| !id.is_empty())
            .cloned()
            .collect();
        let recent_cutoff = options
            .recent_hours
            .filter(|h| *h > 0.0)
            .map(|h| Utc::now() - Duration::seconds((h * 3600.0) as i64));
        UnresolvedQuery {
            limit: options.limit.filter(|l| *l > 0),
            event_ids: event_ids.into_iter().collect(),
            recent_cutoff,
        }
    }

    #[instrument(skip_all)]
    pub async fn run(&self, options: &ResolutionOptions) -> Result<ResolutionSummary> {
        let batch_size = options
            .batch_size
            .unwrap_or(self.config.resolution.batch_size);
        let query = self.query(options);
        info!(
            "Starting resolution sweep: limit={:?}, batch_size={}, event_filter={:?}, recent_cutoff={:?}",
            query.limit, batch_size, query.event_ids, query.recent_cutoff
        );

        let mut summary = ResolutionSummary::default();
        let session = self.sessions.begin().await?;
        let candidates = session.fetch_unresolved_markets(&query).await?;
        if candidates.is_empty() {
            info!("No unresolved markets found; sweep completed with no updates");
            session.commit().await?;
            return Ok(summary);
        }
        info!("Resolution sweep evaluating {} markets", candidates.len());

        let chunk_size = if batch_size <= 0 {
            candidates.len()
        } else {
            batch_size as usize
        };
        let mut affected_events = BTreeSet::new();
        for (index, chunk) in candidates.chunks(chunk_size).enumerate() {
            debug!("Checking resolution chunk {} ({} markets)", index + 1, chunk.len());
            for record in chunk {
                self.check_market(session.as_ref(), record, &mut summary, &mut affected_events)
                    .await?;
            }
        }

        for event_id in &affected_events {
            if session.refresh_event_resolution(event_id).await?.is_some() {
                summary.updated_events += 1;
            }
        }
        session.commit().await?;

        info!(
            "Resolution sweep finished: checked={}, newly_resolved={}, events_updated={}",
            summary.checked_markets, summary.newly_resolved, summary.updated_events
        );
        if !summary.failures.is_empty() {
            warn!(
                "Resolution data unavailable for {} markets",
                summary.failures.len()
            );
        }
        Ok(summary)
    }

    async fn fetch_snapshot(&self, market_id: &str) -> std::result::Result<NormalizedMarket, String> {
        match self.source.fetch_market(market_id).await {
            Ok(Some(raw)) => normalize_market(&raw).map_err(|e| {
                warn!("Failed to normalize upstream market {}: {}", market_id, e);
                UNAVAILABLE.to_string()
            }),
            Ok(None) => Err(UNAVAILABLE.to_string()),
            Err(e) => {
                warn!("Failed to fetch market {} for resolution: {}", market_id, e);
                Err(UNAVAILABLE.to_string())
            }
        }
    }

    async fn check_market(
        &self,
        session: &dyn PipelineSession,
        record: &MarketRecord,
        summary: &mut ResolutionSummary,
        affected_events: &mut BTreeSet<String>,
    ) -> Result<()> {
        summary.checked_markets += 1;
        let snapshot = match self.fetch_snapshot(&record.market_id).await {
            Ok(snapshot) => snapshot,
            Err(reason) => {
                summary.record_failure(&record.market_id, reason);
                return Ok(());
            }
        };

        let now = Utc::now();
        if !snapshot.is_resolved.unwrap_or(false) {
            session.mark_market_synced(&record.market_id, now).await?;
            summary.still_open += 1;
            return Ok(());
        }

        let mut update = MarketResolutionUpdate::from_market(&snapshot, now);
        update.market_id = record.market_id.clone();
        session.apply_market_resolution(&update).await?;

        if record.is_resolved {
            summary.already_resolved += 1;
        } else {
            summary.newly_resolved += 1;
            debug!("Market {} resolved", record.market_id);
            if let Some(event_id) = &record.event_id {
                affected_events.insert(event_id.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::MockMarketSource;
    use crate::persistence::InMemoryStore;
    use serde_json::json;

    fn raw_market(id: &str, resolved: bool) -> serde_json::Value {
        let mut market = json!({
            "id": id,
            "question": "Q?",
            "outcomes": "[\"Yes\", \"No\"]",
            "outcomePrices": "[\"0.5\", \"0.5\"]",
            "events": [{"id": "e1"}],
        });
        if resolved {
            market["closed"] = json!(true);
            market["outcomePrices"] = json!("[\"1\", \"0\"]");
            market["umaResolutionStatus"] = json!("resolved");
        }
        market
    }

    async fn seed(store: &InMemoryStore, ids: &[&str]) {
        let session = store.begin().await.unwrap();
        for id in ids {
            let market = normalize_market(&raw_market(id, false)).unwrap();
            session.upsert_market(&market).await.unwrap();
        }
        session.commit().await.unwrap();
    }

    #[test]
    fn test_query_unions_forced_event_ids() {
        let mut config = AppConfig::default_config();
        config.resolution.force_event_ids = vec!["forced".to_string()];
        let source = MockMarketSource::new();
        let store = InMemoryStore::new();
        let sweep = ResolutionSweep::new(&config, &source, &store);

        let query = sweep.query(&ResolutionOptions {
            limit: Some(0),
            event_ids: vec!["e1".to_string(), "forced".to_string()],
            ..Default::default()
        });
        assert_eq!(query.event_ids, vec!["e1".to_string(), "forced".to_string()]);
        assert_eq!(query.limit, None);
        assert!(query.recent_cutoff.is_none());
    }

    #[tokio::test]
    async fn test_empty_store_is_a_noop() {
        let config = AppConfig::default_config();
        let mut source = MockMarketSource::new();
        source.expect_fetch_market().never();
        let store = InMemoryStore::new();
        let summary = ResolutionSweep::new(&config, &source, &store)
            .run(&ResolutionOptions::default())
            .await
            .unwrap();
        assert_eq!(summary, ResolutionSummary::default());
    }

    #[tokio::test]
    async fn test_fetch_failure_does_not_abort_batch() {
        let config = AppConfig::default_config();
        let store = InMemoryStore::new();
        seed(&store, &["m1", "m2", "m3"]).await;

        let mut source = MockMarketSource::new();
        source.expect_fetch_market().returning(|id| match id {
            "m1" => Err(crate::error::PipelineError::Upstream("timeout".to_string())),
            "m2" => Ok(None),
            _ => Ok(Some(raw_market(id, false))),
        });

        let summary = ResolutionSweep::new(&config, &source, &store)
            .run(&ResolutionOptions {
                batch_size: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.checked_markets, 3);
        assert_eq!(summary.still_open, 1);
        assert_eq!(summary.failures.len(), 2);
        assert!(summary.failures.iter().all(|f| f.reason == UNAVAILABLE));
    }
}
