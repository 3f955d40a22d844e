//! Buckets normalized markets into event-scoped groups.

use crate::domain::{EventMarketGroup, NormalizedEvent, NormalizedMarket};
use std::collections::HashMap;

/// Accumulates markets in first-seen order of their event key.
///
/// Markets without an event form single-market groups keyed `market:<id>`. When a
/// bucket was opened by a market without event data and a later market of the same
/// key carries it, the bucket adopts that event.
#[derive(Debug, Default)]
pub struct GroupBuilder {
    order: Vec<String>,
    buckets: HashMap<String, (Option<NormalizedEvent>, Vec<NormalizedMarket>)>,
    market_count: usize,
}

impl GroupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, market: NormalizedMarket) {
        let key = match market.event_id() {
            Some(event_id) => event_id.to_string(),
            None => format!("market:{}", market.market_id),
        };
        let event = market.event.clone().filter(|e| !e.event_id.is_empty());
        self.market_count += 1;

        match self.buckets.get_mut(&key) {
            Some((bucket_event, markets)) => {
                if bucket_event.is_none() && event.is_some() {
                    *bucket_event = event;
                }
                markets.push(market);
            }
            None => {
                self.order.push(key.clone());
                self.buckets.insert(key, (event, vec![market]));
            }
        }
    }

    pub fn group_count(&self) -> usize {
        self.order.len()
    }

    pub fn market_count(&self) -> usize {
        self.market_count
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Groups in first-seen order
    pub fn finish(mut self) -> Vec<EventMarketGroup> {
        self.order
            .iter()
            .filter_map(|key| self.buckets.remove(key))
            .map(|(event, markets)| EventMarketGroup::new(event, markets))
            .collect()
    }
}

/// Group a batch of markets in one call
pub fn group_markets(markets: impl IntoIterator<Item = NormalizedMarket>) -> Vec<EventMarketGroup> {
    let mut builder = GroupBuilder::new();
    for market in markets {
        builder.push(market);
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(id: &str, event: Option<&str>) -> NormalizedMarket {
        let mut m = NormalizedMarket::new(id, format!("question {id}"));
        m.event = event.map(NormalizedEvent::new);
        m
    }

    #[test]
    fn test_groups_preserve_first_seen_order() {
        let groups = group_markets(vec![
            market("m1", Some("e2")),
            market("m2", Some("e1")),
            market("m3", Some("e2")),
            market("m4", None),
        ]);

        let keys: Vec<String> = groups.iter().filter_map(|g| g.event_key()).collect();
        assert_eq!(keys, vec!["e2", "e1", "market:m4"]);
        let ids: Vec<&str> = groups[0].markets.iter().map(|m| m.market_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m3"]);
        assert!(groups[2].event.is_none());
    }

    #[test]
    fn test_empty_event_id_is_treated_as_missing() {
        let mut builder = GroupBuilder::new();
        builder.push(market("m1", Some("")));
        builder.push(market("m2", Some("")));
        assert_eq!(builder.group_count(), 2);
        assert_eq!(builder.market_count(), 2);

        let groups = builder.finish();
        assert_eq!(groups[0].event_key().as_deref(), Some("market:m1"));
    }

    #[test]
    fn test_shared_event_forms_one_group() {
        let mut builder = GroupBuilder::new();
        builder.push(market("a", Some("e9")));
        builder.push(market("b", Some("e9")));
        assert!(!builder.is_empty());

        let groups = builder.finish();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].event.as_ref().map(|e| e.event_id.as_str()), Some("e9"));
        assert_eq!(groups[0].markets.len(), 2);
    }
}
