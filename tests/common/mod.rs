#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use forecast_pipeline::error::{PipelineError, Result};
use forecast_pipeline::ingestion::{MarketFilters, MarketSource};
use forecast_pipeline::pipeline::RunOptions;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// Upstream catalogue backed by fixed payloads
#[derive(Default)]
pub struct FakeSource {
    pub listing: Vec<Value>,
    pub by_id: Mutex<HashMap<String, Value>>,
    /// Market ids whose lookup fails with a transport error
    pub failing: Vec<String>,
}

impl FakeSource {
    pub fn with_listing(listing: Vec<Value>) -> Self {
        let by_id = listing
            .iter()
            .filter_map(|m| Some((m.get("id")?.as_str()?.to_string(), m.clone())))
            .collect();
        Self {
            listing,
            by_id: Mutex::new(by_id),
            failing: Vec::new(),
        }
    }

    pub fn set_market(&self, market: Value) {
        let id = market["id"].as_str().unwrap_or_default().to_string();
        self.by_id.lock().unwrap().insert(id, market);
    }
}

#[async_trait]
impl MarketSource for FakeSource {
    async fn fetch_markets(&self, _filters: &MarketFilters) -> Result<Vec<Value>> {
        Ok(self.listing.clone())
    }

    async fn fetch_market(&self, market_id: &str) -> Result<Option<Value>> {
        if self.failing.iter().any(|id| id == market_id) {
            return Err(PipelineError::Upstream(format!("lookup of {market_id} timed out")));
        }
        Ok(self.by_id.lock().unwrap().get(market_id).cloned())
    }
}

/// Open binary market with Yes/No prices
pub fn market(id: &str, event_id: Option<&str>, yes: f64) -> Value {
    let mut market = json!({
        "id": id,
        "question": format!("Will {id} happen?"),
        "slug": format!("slug-{id}"),
        "endDate": "2025-03-02T18:00:00Z",
        "outcomes": "[\"Yes\", \"No\"]",
        "outcomePrices": format!("[\"{}\", \"{}\"]", yes, 1.0 - yes),
    });
    if let Some(event_id) = event_id {
        market["events"] = json!([{"id": event_id, "title": format!("Event {event_id}")}]);
    }
    market
}

/// The same market after the oracle settled on Yes
pub fn resolved(mut market: Value) -> Value {
    market["closed"] = json!(true);
    market["umaResolutionStatus"] = json!("resolved");
    market["outcomePrices"] = json!("[\"1\", \"0\"]");
    market["resolvedAt"] = json!("2025-03-02T20:00:00Z");
    market["resolutionSource"] = json!("uma");
    market
}

pub fn run_options(run_id: &str) -> RunOptions {
    let mut options = RunOptions::new(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(), 1);
    options.run_id = Some(run_id.to_string());
    options
}
