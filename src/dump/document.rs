//! Debug dump document: one JSON file per (run, suite, event).

use crate::domain::{NormalizedContract, NormalizedEvent, NormalizedMarket};
use crate::persistence::ProcessedContractInput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpDocument {
    pub run_id: String,
    pub suite_id: String,
    #[serde(default)]
    pub event: Option<DumpEvent>,
    #[serde(default)]
    pub markets: Vec<DumpMarket>,
    /// Research strategy name to its output
    #[serde(default)]
    pub research: BTreeMap<String, DumpResearch>,
    /// Forecast strategy name to market id to forecast
    #[serde(default)]
    pub forecasts: BTreeMap<String, BTreeMap<String, DumpForecast>>,
}

impl DumpDocument {
    /// Event id, else `market:<first market id>`
    pub fn event_key(&self) -> Option<String> {
        match self.event.as_ref().filter(|e| !e.event_id.is_empty()) {
            Some(event) => Some(event.event_id.clone()),
            None => self
                .markets
                .first()
                .map(|m| format!("market:{}", m.market_id)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpEvent {
    pub event_id: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub series_slug: Option<String>,
    #[serde(default)]
    pub series_title: Option<String>,
}

impl From<&NormalizedEvent> for DumpEvent {
    fn from(event: &NormalizedEvent) -> Self {
        Self {
            event_id: event.event_id.clone(),
            slug: event.slug.clone(),
            title: event.title.clone(),
            description: event.description.clone(),
            start_time: event.start_time,
            end_time: event.end_time,
            icon_url: event.icon_url.clone(),
            series_slug: event.series_slug.clone(),
            series_title: event.series_title.clone(),
        }
    }
}

impl DumpEvent {
    /// `None` when the dump carries no usable event id
    pub fn to_event(&self) -> Option<NormalizedEvent> {
        if self.event_id.is_empty() {
            return None;
        }
        let mut event = NormalizedEvent::new(self.event_id.clone());
        event.slug = self.slug.clone();
        event.title = self.title.clone();
        event.description = self.description.clone();
        event.start_time = self.start_time;
        event.end_time = self.end_time;
        event.icon_url = self.icon_url.clone();
        event.series_slug = self.series_slug.clone();
        event.series_title = self.series_title.clone();
        Some(event)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpContract {
    pub contract_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub outcome_type: Option<String>,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub implied_probability: Option<f64>,
}

impl DumpContract {
    fn to_contract(&self) -> NormalizedContract {
        NormalizedContract {
            contract_id: self.contract_id.clone(),
            name: self.name.clone().unwrap_or_else(|| "Unknown".to_string()),
            outcome_type: self.outcome_type.clone(),
            current_price: self.current_price,
            confidence: self.confidence,
            implied_probability: self.implied_probability,
            raw_data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpMarket {
    pub market_id: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sub_category: Option<String>,
    #[serde(default)]
    pub open_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub volume_usd: Option<f64>,
    #[serde(default)]
    pub liquidity_usd: Option<f64>,
    #[serde(default)]
    pub fee_bps: Option<i64>,
    #[serde(default)]
    pub contracts: Vec<DumpContract>,
}

impl From<&NormalizedMarket> for DumpMarket {
    fn from(market: &NormalizedMarket) -> Self {
        Self {
            market_id: market.market_id.clone(),
            slug: market.slug.clone(),
            question: Some(market.question.clone()),
            category: market.category.clone(),
            sub_category: market.sub_category.clone(),
            open_time: market.open_time,
            close_time: market.close_time,
            status: Some(market.status.clone()),
            volume_usd: market.volume_usd,
            liquidity_usd: market.liquidity_usd,
            fee_bps: market.fee_bps,
            contracts: market
                .contracts
                .iter()
                .map(|c| DumpContract {
                    contract_id: c.contract_id.clone(),
                    name: Some(c.name.clone()),
                    outcome_type: c.outcome_type.clone(),
                    current_price: c.current_price,
                    confidence: c.confidence,
                    implied_probability: c.implied_probability,
                })
                .collect(),
        }
    }
}

impl DumpMarket {
    pub fn to_market(&self, event: Option<NormalizedEvent>) -> NormalizedMarket {
        let mut market = NormalizedMarket::new(
            self.market_id.clone(),
            self.question.clone().unwrap_or_default(),
        );
        market.slug = self.slug.clone();
        market.category = self.category.clone();
        market.sub_category = self.sub_category.clone();
        market.open_time = self.open_time;
        market.close_time = self.close_time;
        if let Some(status) = self.status.as_ref().filter(|s| !s.is_empty()) {
            market.status = status.clone();
        }
        market.volume_usd = self.volume_usd;
        market.liquidity_usd = self.liquidity_usd;
        market.fee_bps = self.fee_bps;
        market.event = event;
        market.contracts = self.contracts.iter().map(DumpContract::to_contract).collect();
        market
    }

    pub fn processed_contracts(&self) -> Vec<ProcessedContractInput> {
        self.contracts
            .iter()
            .map(|c| ProcessedContractInput::from(&c.to_contract()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpResearch {
    pub variant: String,
    pub version: String,
    #[serde(default)]
    pub artifact_id: Option<String>,
    #[serde(default)]
    pub artifact_uri: Option<String>,
    #[serde(default)]
    pub artifact_hash: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub diagnostics: Option<Value>,
    #[serde(default)]
    pub experiment_run_id: Option<String>,
    #[serde(default)]
    pub experiment_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpForecast {
    #[serde(rename = "outcomePrices", default)]
    pub outcome_prices: BTreeMap<String, f64>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub experiment_run_id: Option<String>,
    #[serde(default)]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub artifact_uri: Option<String>,
    #[serde(default)]
    pub diagnostics: Option<Value>,
    /// Research name to artifact id
    #[serde(rename = "_research_artifacts", default)]
    pub research_artifacts: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_minimal_document() {
        let doc: DumpDocument = serde_json::from_value(json!({
            "run_id": "r",
            "suite_id": "s",
            "event": null,
            "markets": [{"market_id": "m1", "contracts": [{"contract_id": "c1"}]}],
            "research": {},
            "forecasts": {"f": {"m1": {"outcomePrices": {"Yes": 0.4}, "reasoning": "r"}}}
        }))
        .unwrap();

        assert_eq!(doc.event_key().as_deref(), Some("market:m1"));
        let market = doc.markets[0].to_market(None);
        assert_eq!(market.status, "open");
        assert_eq!(market.contracts[0].name, "Unknown");
        let forecast = &doc.forecasts["f"]["m1"];
        assert!(forecast.research_artifacts.is_empty());
        assert_eq!(forecast.outcome_prices["Yes"], 0.4);
    }

    #[test]
    fn test_event_round_trip() {
        let mut event = NormalizedEvent::new("e1");
        event.title = Some("Title".to_string());
        event.raw_data = Some(json!({"id": "e1"}));
        let dumped = DumpEvent::from(&event);
        let back = dumped.to_event().unwrap();
        assert_eq!(back.title.as_deref(), Some("Title"));
        assert!(back.raw_data.is_none());

        let empty = DumpEvent::from(&NormalizedEvent::new(""));
        assert!(empty.to_event().is_none());
    }
}
