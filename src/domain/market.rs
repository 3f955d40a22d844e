use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Market lifecycle status as stored on market rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Resolved,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Closed => "closed",
            MarketStatus::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Clean contract (outcome) snapshot ready for persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedContract {
    pub contract_id: String,
    pub name: String,
    #[serde(default)]
    pub outcome_type: Option<String>,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub implied_probability: Option<f64>,
    #[serde(default)]
    pub raw_data: Option<Value>,
}

/// Clean event snapshot potentially shared by multiple markets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
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
    #[serde(default)]
    pub raw_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_resolved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_source: Option<String>,
}

impl NormalizedEvent {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            slug: None,
            title: None,
            description: None,
            start_time: None,
            end_time: None,
            icon_url: None,
            series_slug: None,
            series_title: None,
            raw_data: None,
            is_resolved: None,
            resolved_at: None,
            resolution_source: None,
        }
    }
}

/// Normalized market with nested contracts and optional upstream event.
///
/// The parent event is not part of the serialized form; dumps and stores keep
/// events separately and re-attach them on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMarket {
    pub market_id: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sub_category: Option<String>,
    #[serde(default)]
    pub open_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub volume_usd: Option<f64>,
    #[serde(default)]
    pub liquidity_usd: Option<f64>,
    #[serde(default)]
    pub fee_bps: Option<i64>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(skip_serializing, default)]
    pub event: Option<NormalizedEvent>,
    #[serde(default)]
    pub contracts: Vec<NormalizedContract>,
    #[serde(default)]
    pub raw_data: Option<Value>,
    #[serde(default)]
    pub is_resolved: Option<bool>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution_source: Option<String>,
    #[serde(default)]
    pub winning_outcome: Option<String>,
    #[serde(default)]
    pub payout_token: Option<String>,
    #[serde(default)]
    pub resolution_tx_hash: Option<String>,
    #[serde(default)]
    pub resolution_notes: Option<String>,
}

fn default_status() -> String {
    MarketStatus::Open.as_str().to_string()
}

impl NormalizedMarket {
    /// Minimal open market, mostly useful for building fixtures
    pub fn new(market_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            slug: None,
            question: question.into(),
            category: None,
            sub_category: None,
            open_time: None,
            close_time: None,
            volume_usd: None,
            liquidity_usd: None,
            fee_bps: None,
            status: default_status(),
            description: None,
            icon_url: None,
            event: None,
            contracts: Vec::new(),
            raw_data: None,
            is_resolved: None,
            resolved_at: None,
            resolution_source: None,
            winning_outcome: None,
            payout_token: None,
            resolution_tx_hash: None,
            resolution_notes: None,
        }
    }

    /// Event id of the parent event, when the market has one
    pub fn event_id(&self) -> Option<&str> {
        self.event
            .as_ref()
            .map(|e| e.event_id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// An optional event plus the ordered markets processed together in one pass
#[derive(Debug, Clone, PartialEq)]
pub struct EventMarketGroup {
    pub event: Option<NormalizedEvent>,
    pub markets: Vec<NormalizedMarket>,
}

impl EventMarketGroup {
    pub fn new(event: Option<NormalizedEvent>, markets: Vec<NormalizedMarket>) -> Self {
        Self { event, markets }
    }

    /// Stable key: the event id, else `market:<first market id>`
    pub fn event_key(&self) -> Option<String> {
        event_key(self.event.as_ref(), self.markets.first().map(|m| m.market_id.as_str()))
    }

    /// Event id for log lines (`none` for synthetic single-market groups)
    pub fn event_label(&self) -> &str {
        self.event
            .as_ref()
            .map(|e| e.event_id.as_str())
            .unwrap_or("none")
    }

    pub fn contains_market(&self, market_id: &str) -> bool {
        self.markets.iter().any(|m| m.market_id == market_id)
    }
}

/// Event key shared by grouping, debug dumps, and replay
pub fn event_key(event: Option<&NormalizedEvent>, first_market_id: Option<&str>) -> Option<String> {
    match event {
        Some(e) if !e.event_id.is_empty() => Some(e.event_id.clone()),
        _ => first_market_id.map(|id| format!("market:{id}")),
    }
}
