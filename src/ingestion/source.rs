use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// Query parameters passed to the upstream market listing
pub type MarketFilters = BTreeMap<String, Value>;

/// Upstream market catalogue.
///
/// Payloads are returned raw; normalization happens in the pipeline so that a
/// single malformed record only fails that record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Every market matching `filters`, across all pages
    async fn fetch_markets(&self, filters: &MarketFilters) -> Result<Vec<Value>>;

    /// A single market by id, `None` when the upstream does not know it
    async fn fetch_market(&self, market_id: &str) -> Result<Option<Value>>;
}
