//! Normalization of raw market-catalogue payloads.
//!
//! Upstream payloads are loosely typed: numbers arrive as strings, lists arrive as
//! JSON-encoded strings, and several fields have historical aliases. Everything is
//! funnelled into [`NormalizedMarket`] here so the rest of the pipeline only deals
//! with typed values.

use crate::domain::market::{MarketStatus, NormalizedContract, NormalizedEvent, NormalizedMarket};
use crate::error::NormalizeError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

/// Price at or above which an outcome of a closed market is treated as the winner
const WINNING_PRICE: f64 = 0.999;

/// Normalize one raw market payload
pub fn normalize_market(raw: &Value) -> Result<NormalizedMarket, NormalizeError> {
    let obj = raw.as_object().ok_or(NormalizeError::NotAnObject)?;
    let market_id = first_string(obj, &["id", "marketId", "_id"]).ok_or(NormalizeError::MissingId)?;

    let contracts: Vec<NormalizedContract> = build_contracts(obj, &market_id)
        .iter()
        .map(|c| normalize_contract(c, &market_id))
        .collect();

    let event = extract_event(obj);
    let closed = obj.get("closed").and_then(Value::as_bool).unwrap_or(false);
    let resolution = extract_resolution(obj, closed, &contracts);

    let status = match first_string(obj, &["status"]) {
        Some(s) => s.to_lowercase(),
        None if resolution.is_resolved => MarketStatus::Resolved.as_str().to_string(),
        None if closed => MarketStatus::Closed.as_str().to_string(),
        None => MarketStatus::Open.as_str().to_string(),
    };

    Ok(NormalizedMarket {
        slug: first_string(obj, &["slug"]),
        question: first_string(obj, &["question", "title"]).unwrap_or_default(),
        category: first_string(obj, &["category"]),
        sub_category: first_string(obj, &["subCategory", "subcategory"]),
        open_time: first_datetime(obj, &["openTime", "startDate"]),
        close_time: first_datetime(obj, &["closeTime", "endDate"]),
        volume_usd: first_float(obj, &["volume", "volumeUsd"]),
        liquidity_usd: first_float(obj, &["liquidity", "liquidityUsd"]),
        fee_bps: first_float(obj, &["fee"]).map(fee_bps_from_fee),
        status,
        description: first_string(obj, &["description"]),
        icon_url: first_string(obj, &["icon", "image"]),
        event,
        contracts,
        raw_data: Some(raw.clone()),
        is_resolved: Some(resolution.is_resolved),
        resolved_at: resolution.resolved_at,
        resolution_source: resolution.source,
        winning_outcome: resolution.winning_outcome,
        payout_token: resolution.payout_token,
        resolution_tx_hash: resolution.tx_hash,
        resolution_notes: resolution.notes,
        market_id,
    })
}

/// Fees above 1 are percentages, otherwise fractions
fn fee_bps_from_fee(fee: f64) -> i64 {
    if fee > 1.0 {
        (fee * 100.0).round() as i64
    } else {
        (fee * 10_000.0).round() as i64
    }
}

fn build_contracts(obj: &Map<String, Value>, market_id: &str) -> Vec<Map<String, Value>> {
    if let Some(Value::Array(items)) = obj.get("contracts") {
        if items.iter().all(Value::is_object) {
            return items
                .iter()
                .filter_map(|v| v.as_object().cloned())
                .collect();
        }
    }

    let outcomes = as_list(obj.get("outcomes"));
    if outcomes.is_empty() {
        return Vec::new();
    }

    let prices = as_list(obj.get("outcomePrices"));
    let mut token_ids = as_list(obj.get("clobTokenIds"));
    if token_ids.is_empty() {
        token_ids = as_list(obj.get("tokenIds"));
    }
    let market_type = first_string(obj, &["marketType", "type"]);

    outcomes
        .iter()
        .enumerate()
        .map(|(index, outcome)| {
            let mut contract = match outcome {
                Value::Object(map) => map.clone(),
                other => {
                    let mut map = Map::new();
                    map.insert("name".to_string(), Value::String(value_to_string(other)));
                    map
                }
            };

            let token = token_ids
                .get(index)
                .filter(|t| !t.is_null() && value_to_string(t) != "")
                .cloned()
                .unwrap_or_else(|| Value::String(format!("{market_id}-{index}")));
            contract.entry("id").or_insert(token);

            if let Some(price) = prices.get(index) {
                contract.entry("price").or_insert_with(|| price.clone());
                contract
                    .entry("impliedProbability")
                    .or_insert_with(|| price.clone());
            }
            if let Some(kind) = &market_type {
                contract
                    .entry("outcomeType")
                    .or_insert_with(|| Value::String(kind.clone()));
            }
            contract
        })
        .collect()
}

fn normalize_contract(raw: &Map<String, Value>, market_id: &str) -> NormalizedContract {
    let contract_id = first_string(raw, &["id", "contractId", "_id"]).unwrap_or_else(|| {
        let fallback = first_string(raw, &["name", "title"]).unwrap_or_else(|| "contract".to_string());
        format!("{market_id}-{fallback}")
    });
    let price = first_float(raw, &["price", "lastPrice"]);
    let implied_probability =
        first_float(raw, &["impliedProbability", "impliedProbabilityRounded"]).or(price);

    NormalizedContract {
        contract_id,
        name: first_string(raw, &["name", "title"]).unwrap_or_else(|| "Unknown".to_string()),
        outcome_type: first_string(raw, &["outcomeType", "type", "outcome_type"]),
        current_price: price,
        confidence: first_float(raw, &["confidence"]),
        implied_probability,
        raw_data: Some(Value::Object(raw.clone())),
    }
}

fn extract_event(obj: &Map<String, Value>) -> Option<NormalizedEvent> {
    let raw_event = match obj.get("events") {
        Some(Value::Array(events)) => events.first().and_then(Value::as_object),
        _ => None,
    }
    .or_else(|| obj.get("event").and_then(Value::as_object))?;

    let event_id = first_string(raw_event, &["id", "eventId"])?;
    let series = match raw_event.get("series") {
        Some(Value::Array(items)) => items.first().and_then(Value::as_object),
        Some(Value::Object(map)) => Some(map),
        _ => None,
    };

    Some(NormalizedEvent {
        event_id,
        slug: first_string(raw_event, &["slug"]),
        title: first_string(raw_event, &["title"]),
        description: first_string(raw_event, &["description"]),
        start_time: first_datetime(raw_event, &["startDate", "startTime"]),
        end_time: first_datetime(raw_event, &["endDate", "endTime"]),
        icon_url: first_string(raw_event, &["icon", "image"]),
        series_slug: first_string(raw_event, &["seriesSlug"])
            .or_else(|| series.and_then(|s| first_string(s, &["slug"]))),
        series_title: first_string(raw_event, &["seriesTitle"])
            .or_else(|| series.and_then(|s| first_string(s, &["title"]))),
        raw_data: Some(Value::Object(raw_event.clone())),
        is_resolved: None,
        resolved_at: None,
        resolution_source: None,
    })
}

#[derive(Debug, Default)]
struct ResolutionFields {
    is_resolved: bool,
    resolved_at: Option<DateTime<Utc>>,
    source: Option<String>,
    winning_outcome: Option<String>,
    payout_token: Option<String>,
    tx_hash: Option<String>,
    notes: Option<String>,
}

fn extract_resolution(
    obj: &Map<String, Value>,
    closed: bool,
    contracts: &[NormalizedContract],
) -> ResolutionFields {
    let uma_resolved = first_string(obj, &["umaResolutionStatus"])
        .map(|s| s.eq_ignore_ascii_case("resolved"))
        .unwrap_or(false);
    let flagged = obj.get("resolved").and_then(Value::as_bool).unwrap_or(false);

    let winners: Vec<&NormalizedContract> = contracts
        .iter()
        .filter(|c| c.current_price.map(|p| p >= WINNING_PRICE).unwrap_or(false))
        .collect();
    let winner = if winners.len() == 1 { Some(winners[0]) } else { None };

    let is_resolved = uma_resolved || flagged || (closed && winner.is_some());
    if !is_resolved {
        return ResolutionFields::default();
    }

    ResolutionFields {
        is_resolved,
        resolved_at: first_datetime(obj, &["resolvedAt", "closedTime", "umaEndDate"]),
        source: first_string(obj, &["resolutionSource", "resolvedBy"]),
        winning_outcome: first_string(obj, &["winningOutcome"])
            .or_else(|| winner.map(|c| c.name.clone())),
        payout_token: winner.map(|c| c.contract_id.clone()),
        tx_hash: first_string(obj, &["resolutionTxHash"]),
        notes: first_string(obj, &["resolutionNotes"]),
    }
}

/// Return value as a list, decoding JSON-encoded string lists
fn as_list(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn first_string(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .next()
}

fn parse_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn first_float(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(parse_float)
}

/// Parse RFC 3339 timestamps, naive timestamps (UTC assumed), or bare dates
pub(crate) fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let candidate = raw.trim();
    if candidate.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(candidate) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(candidate, "%Y-%m-%d %H:%M:%S%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(candidate, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(candidate, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn first_datetime(obj: &Map<String, Value>, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(Value::as_str)
        .find_map(parse_datetime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builds_contracts_from_encoded_outcomes() {
        let raw = json!({
            "id": "123",
            "question": "Will it rain tomorrow?",
            "outcomes": "[\"Yes\", \"No\"]",
            "outcomePrices": "[\"0.62\", \"0.38\"]",
            "clobTokenIds": "[\"tok-yes\", \"tok-no\"]",
            "fee": "0.02",
            "volume": "1520.5",
            "endDate": "2025-03-01T12:00:00Z"
        });

        let market = normalize_market(&raw).unwrap();
        assert_eq!(market.market_id, "123");
        assert_eq!(market.contracts.len(), 2);
        assert_eq!(market.contracts[0].contract_id, "tok-yes");
        assert_eq!(market.contracts[0].name, "Yes");
        assert_eq!(market.contracts[0].current_price, Some(0.62));
        assert_eq!(market.contracts[1].implied_probability, Some(0.38));
        assert_eq!(market.fee_bps, Some(200));
        assert_eq!(market.volume_usd, Some(1520.5));
        assert_eq!(market.status, "open");
        assert!(market.close_time.is_some());
        assert_eq!(market.is_resolved, Some(false));
    }

    #[test]
    fn test_fee_percentages_and_fractions() {
        assert_eq!(fee_bps_from_fee(2.0), 200);
        assert_eq!(fee_bps_from_fee(0.015), 150);
    }

    #[test]
    fn test_missing_id_is_rejected() {
        let err = normalize_market(&json!({"question": "?"})).unwrap_err();
        assert_eq!(err, NormalizeError::MissingId);
        assert_eq!(
            normalize_market(&json!([1, 2])).unwrap_err(),
            NormalizeError::NotAnObject
        );
    }

    #[test]
    fn test_token_fallback_ids() {
        let raw = json!({"id": 9, "outcomes": ["A", "B"]});
        let market = normalize_market(&raw).unwrap();
        assert_eq!(market.market_id, "9");
        assert_eq!(market.contracts[0].contract_id, "9-0");
        assert_eq!(market.contracts[1].contract_id, "9-1");
    }

    #[test]
    fn test_extracts_event_and_series() {
        let raw = json!({
            "id": "m1",
            "outcomes": ["Yes", "No"],
            "events": [{
                "id": "e1",
                "title": "Election",
                "series": [{"slug": "elections", "title": "Elections"}]
            }]
        });
        let market = normalize_market(&raw).unwrap();
        let event = market.event.unwrap();
        assert_eq!(event.event_id, "e1");
        assert_eq!(event.title.as_deref(), Some("Election"));
        assert_eq!(event.series_slug.as_deref(), Some("elections"));
        assert_eq!(event.series_title.as_deref(), Some("Elections"));
    }

    #[test]
    fn test_closed_market_with_single_winner_is_resolved() {
        let raw = json!({
            "id": "m2",
            "closed": true,
            "outcomes": ["Yes", "No"],
            "outcomePrices": ["1", "0"],
            "clobTokenIds": ["t-yes", "t-no"],
            "closedTime": "2025-02-01 18:30:00+00",
            "resolutionSource": "https://example.com/result"
        });
        let market = normalize_market(&raw).unwrap();
        assert_eq!(market.is_resolved, Some(true));
        assert_eq!(market.status, "resolved");
        assert_eq!(market.winning_outcome.as_deref(), Some("Yes"));
        assert_eq!(market.payout_token.as_deref(), Some("t-yes"));
        assert_eq!(
            market.resolution_source.as_deref(),
            Some("https://example.com/result")
        );
        assert!(market.resolved_at.is_some());
    }

    #[test]
    fn test_parse_datetime_variants() {
        assert!(parse_datetime("2025-01-01T00:00:00Z").is_some());
        assert!(parse_datetime("2025-01-01T00:00:00.123").is_some());
        assert!(parse_datetime("2025-01-01").is_some());
        assert!(parse_datetime("not a date").is_none());
        assert!(parse_datetime("  ").is_none());
    }
}
