//! Plain-text renderings of groups and markets for LLM prompts.

use crate::domain::{EventMarketGroup, NormalizedEvent, NormalizedMarket};
use chrono::{SecondsFormat, Utc};

const MAX_NOTE_CHARS: usize = 400;

fn truncated(prefix: &str, text: &str) -> String {
    format!("{prefix}{}", text.trim()).chars().take(MAX_NOTE_CHARS).collect()
}

pub fn format_event(event: &NormalizedEvent) -> String {
    let summary = event
        .title
        .as_deref()
        .or(event.slug.as_deref())
        .unwrap_or(event.event_id.as_str());
    let mut lines = vec![format!("Event: {summary}")];
    if let Some(start) = event.start_time {
        lines.push(format!("Starts: {}", start.to_rfc3339()));
    }
    if let Some(end) = event.end_time {
        lines.push(format!("Ends: {}", end.to_rfc3339()));
    }
    if let Some(series) = &event.series_title {
        lines.push(format!("Series: {series}"));
    }
    if let Some(description) = &event.description {
        lines.push(truncated("Description: ", description));
    }
    lines.join("\n")
}

/// Market block; contract prices are left out of forecast prompts
pub fn format_market(market: &NormalizedMarket, include_prices: bool) -> String {
    let closes = market
        .close_time
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());
    let mut lines = vec![
        format!("Market: {}", market.question),
        format!("Status: {} (closes {closes})", market.status),
    ];
    if let Some(description) = &market.description {
        lines.push(truncated("Notes: ", description));
    }
    if !market.contracts.is_empty() {
        lines.push("Outcomes:".to_string());
        for contract in &market.contracts {
            if include_prices {
                let price = contract
                    .current_price
                    .map(|p| format!("{p:.2}"))
                    .unwrap_or_else(|| "unknown".to_string());
                lines.push(format!("- {}: price={price}", contract.name));
            } else {
                lines.push(format!("- {}", contract.name));
            }
        }
    }
    lines.join("\n")
}

pub fn format_group(group: &EventMarketGroup) -> String {
    let mut sections = Vec::with_capacity(group.markets.len() + 1);
    if let Some(event) = &group.event {
        sections.push(format_event(event));
    }
    sections.extend(group.markets.iter().map(|m| format_market(m, true)));
    sections.join("\n\n")
}

/// UTC timestamp with second precision and a `Z` suffix
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NormalizedContract;

    #[test]
    fn test_group_rendering() {
        let mut event = NormalizedEvent::new("e1");
        event.title = Some("Election".to_string());
        let mut market = NormalizedMarket::new("m1", "Will A win?");
        market.contracts.push(NormalizedContract {
            contract_id: "c1".to_string(),
            name: "Yes".to_string(),
            outcome_type: None,
            current_price: Some(0.625),
            confidence: None,
            implied_probability: None,
            raw_data: None,
        });
        let group = EventMarketGroup::new(Some(event), vec![market.clone()]);

        let text = format_group(&group);
        assert!(text.starts_with("Event: Election"));
        assert!(text.contains("Market: Will A win?"));
        assert!(text.contains("Status: open (closes unknown)"));
        assert!(text.contains("- Yes: price=0.62"));
        assert!(format_market(&market, false).ends_with("Outcomes:\n- Yes"));
    }

    #[test]
    fn test_iso_timestamp_shape() {
        let ts = iso_timestamp();
        assert!(ts.ends_with('Z'));
        assert!(!ts.contains('.'));
    }
}
