use crate::domain::EventMarketGroup;
use crate::error::ExecutionError;
use crate::experiments::fingerprint::hash_payload;
use crate::experiments::strategy::{
    ResearchOutput, ResearchStrategy, StrategyContext, StrategyInfo, StrategyOutcome,
};
use async_trait::async_trait;
use serde_json::{json, Value};

pub const MARKET_SNAPSHOT: &str = "market_snapshot";

/// Captures the normalized event, markets and contracts of a group as a research artifact
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot;

impl MarketSnapshot {
    pub fn new() -> Self {
        Self
    }

    fn snapshot(&self, group: &EventMarketGroup) -> Result<Value, ExecutionError> {
        let event = match &group.event {
            Some(event) => serde_json::to_value(event)?,
            None => Value::Null,
        };
        let markets = group
            .markets
            .iter()
            .map(|market| -> Result<Value, ExecutionError> {
                let mut body = serde_json::to_value(market)?;
                let contracts = body
                    .as_object_mut()
                    .and_then(|map| map.remove("contracts"))
                    .unwrap_or_else(|| json!([]));
                Ok(json!({"market": body, "contracts": contracts}))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(json!({"event": event, "markets": markets}))
    }
}

#[async_trait]
impl ResearchStrategy for MarketSnapshot {
    fn info(&self) -> StrategyInfo {
        StrategyInfo {
            name: MARKET_SNAPSHOT.to_string(),
            version: "1.0".to_string(),
            description: Some("Normalized market and contract payloads for auditing".to_string()),
            shared_identity: Some("catalog:market_snapshot:v1.0".to_string()),
        }
    }

    async fn run(
        &self,
        group: &EventMarketGroup,
        _ctx: &StrategyContext<'_>,
    ) -> StrategyOutcome<ResearchOutput> {
        match self.snapshot(group) {
            Ok(payload) => StrategyOutcome::Success(ResearchOutput {
                artifact_hash: hash_payload(&payload),
                payload,
                artifact_uri: None,
                diagnostics: None,
            }),
            Err(err) => StrategyOutcome::Failed(err),
        }
    }
}
