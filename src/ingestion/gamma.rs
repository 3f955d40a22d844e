//! Gamma market catalogue client over plain `reqwest`.

use crate::config::IngestionConfig;
use crate::error::{PipelineError, Result};
use crate::ingestion::source::{MarketFilters, MarketSource};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Query keys the markets endpoint accepts
pub const ALLOWED_FILTER_KEYS: &[&str] = &[
    "limit",
    "offset",
    "order",
    "ascending",
    "id",
    "slug",
    "clob_token_ids",
    "condition_ids",
    "market_maker_address",
    "liquidity_num_min",
    "liquidity_num_max",
    "volume_num_min",
    "volume_num_max",
    "start_date_min",
    "start_date_max",
    "end_date_min",
    "end_date_max",
    "tag_id",
    "related_tags",
    "cyom",
    "uma_resolution_status",
    "game_id",
    "sports_market_types",
    "rewards_min_size",
    "question_ids",
    "include_tag",
    "closed",
];

#[derive(Clone)]
pub struct GammaClient {
    http: Client,
    base_url: String,
    markets_path: String,
    page_size: usize,
}

impl GammaClient {
    pub fn new(config: &IngestionConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("forecast-pipeline/0.1")
            .build()
            .map_err(|e| PipelineError::Internal(format!("failed to build Gamma HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            markets_path: format!("/{}", config.markets_path.trim_matches('/')),
            page_size: config.page_size.max(1),
        })
    }

    fn markets_url(&self) -> String {
        format!("{}{}", self.base_url, self.markets_path)
    }

    /// Query parameters for one page; `limit`/`offset` from the filters are replaced
    fn page_params(
        &self,
        filters: &[(String, String)],
        cursor: Option<&str>,
        offset: usize,
    ) -> Vec<(String, String)> {
        let mut params = vec![
            ("limit".to_string(), self.page_size.to_string()),
            ("offset".to_string(), offset.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor".to_string(), cursor.to_string()));
        }
        params.extend(
            filters
                .iter()
                .filter(|(key, _)| key != "limit" && key != "offset")
                .cloned(),
        );
        params
    }

    async fn fetch_page(&self, params: &[(String, String)]) -> Result<Value> {
        info!("Gamma GET {} params={:?}", self.markets_path, params);
        let response = self
            .http
            .get(self.markets_url())
            .query(params)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Keep supported keys and render values the way the endpoint expects
pub fn prepare_filters(filters: &MarketFilters) -> Vec<(String, String)> {
    let dropped: Vec<&str> = filters
        .keys()
        .map(String::as_str)
        .filter(|key| !ALLOWED_FILTER_KEYS.contains(key))
        .collect();
    if !dropped.is_empty() {
        warn!(
            "Dropped unsupported market query filters: {}",
            dropped.join(", ")
        );
    }

    filters
        .iter()
        .filter(|(key, _)| ALLOWED_FILTER_KEYS.contains(&key.as_str()))
        .filter_map(|(key, value)| serialize_filter_value(value).map(|v| (key.clone(), v)))
        .collect()
}

/// Booleans as `true`/`false`, lists comma-joined, null dropped
pub fn serialize_filter_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(serialize_filter_value).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(","))
            }
        }
        Value::Object(_) => Some(value.to_string()),
    }
}

/// Markets and continuation cursor of one page.
///
/// A page is either a bare list or an object carrying the list under `markets`,
/// `data` or `result` (or a lone `market`), with an optional `cursor`/`nextCursor`.
pub fn parse_page(payload: Value) -> (Vec<Value>, Option<String>) {
    match payload {
        Value::Array(markets) => (markets, None),
        Value::Object(mut map) => {
            let cursor = ["cursor", "nextCursor"]
                .iter()
                .filter_map(|key| map.get(*key).and_then(Value::as_str))
                .find(|c| !c.is_empty())
                .map(str::to_string);

            let mut markets = Vec::new();
            for key in ["markets", "data", "result"] {
                if let Some(Value::Array(items)) = map.remove(key) {
                    if !items.is_empty() {
                        markets = items;
                        break;
                    }
                }
            }
            if markets.is_empty() {
                if let Some(single @ Value::Object(_)) = map.remove("market") {
                    markets.push(single);
                }
            }
            (markets, cursor)
        }
        _ => (Vec::new(), None),
    }
}

#[async_trait]
impl MarketSource for GammaClient {
    async fn fetch_markets(&self, filters: &MarketFilters) -> Result<Vec<Value>> {
        let filters = prepare_filters(filters);
        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        let mut offset = 0usize;

        loop {
            let params = self.page_params(&filters, cursor.as_deref(), offset);
            let (markets, next_cursor) = parse_page(self.fetch_page(&params).await?);
            if markets.is_empty() {
                break;
            }
            let page_len = markets.len();
            collected.extend(markets);

            match next_cursor {
                Some(next) => {
                    cursor = Some(next);
                    offset = 0;
                }
                None => {
                    cursor = None;
                    offset += self.page_size;
                    if page_len < self.page_size {
                        break;
                    }
                }
            }
        }

        debug!("Fetched {} markets from Gamma", collected.len());
        Ok(collected)
    }

    async fn fetch_market(&self, market_id: &str) -> Result<Option<Value>> {
        let url = format!("{}/{}", self.markets_url(), market_id);
        let response = self.http.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let payload: Value = response.error_for_status()?.json().await?;
        let (mut markets, _) = parse_page(payload.clone());
        if markets.is_empty() && payload.get("id").is_some() {
            return Ok(Some(payload));
        }
        Ok(if markets.is_empty() {
            None
        } else {
            Some(markets.swap_remove(0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_serialization() {
        assert_eq!(serialize_filter_value(&json!(false)).as_deref(), Some("false"));
        assert_eq!(serialize_filter_value(&json!(25)).as_deref(), Some("25"));
        assert_eq!(serialize_filter_value(&json!([1, "a", null])).as_deref(), Some("1,a"));
        assert_eq!(serialize_filter_value(&json!([null])), None);
        assert_eq!(serialize_filter_value(&Value::Null), None);
    }

    #[test]
    fn test_prepare_filters_drops_unsupported_keys() {
        let mut filters = MarketFilters::new();
        filters.insert("closed".to_string(), json!(false));
        filters.insert("active_only".to_string(), json!(true));
        filters.insert("tag_id".to_string(), json!([2, 3]));

        let prepared = prepare_filters(&filters);
        assert_eq!(
            prepared,
            vec![
                ("closed".to_string(), "false".to_string()),
                ("tag_id".to_string(), "2,3".to_string()),
            ]
        );
    }

    #[test]
    fn test_page_params_override_paging_keys() {
        let client = GammaClient::new(&IngestionConfig::default()).unwrap();
        let filters = vec![
            ("limit".to_string(), "5".to_string()),
            ("closed".to_string(), "false".to_string()),
        ];
        let params = client.page_params(&filters, Some("abc"), 0);
        assert_eq!(params[0], ("limit".to_string(), "200".to_string()));
        assert_eq!(params[2], ("cursor".to_string(), "abc".to_string()));
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_parse_page_shapes() {
        let (markets, cursor) = parse_page(json!([{"id": "1"}, {"id": "2"}]));
        assert_eq!(markets.len(), 2);
        assert!(cursor.is_none());

        let (markets, cursor) = parse_page(json!({"data": [{"id": "3"}], "nextCursor": "n1"}));
        assert_eq!(markets[0]["id"], "3");
        assert_eq!(cursor.as_deref(), Some("n1"));

        let (markets, _) = parse_page(json!({"markets": [], "result": [{"id": "4"}]}));
        assert_eq!(markets[0]["id"], "4");

        let (markets, _) = parse_page(json!({"market": {"id": "5"}}));
        assert_eq!(markets[0]["id"], "5");

        let (markets, cursor) = parse_page(json!("oops"));
        assert!(markets.is_empty() && cursor.is_none());
    }
}
