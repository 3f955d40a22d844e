use crate::domain::{EventMarketGroup, NormalizedMarket};
use crate::experiments::strategy::{
    ForecastOutput, ForecastStrategy, ResearchInputs, StrategyContext, StrategyInfo,
    StrategyOutcome,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

pub const MARKET_IMPLIED: &str = "market_implied";

/// Baseline forecast that echoes the probabilities implied by current contract prices
#[derive(Debug, Clone, Default)]
pub struct MarketImplied;

impl MarketImplied {
    pub fn new() -> Self {
        Self
    }

    fn forecast_market(market: &NormalizedMarket) -> Option<ForecastOutput> {
        let prices: BTreeMap<String, f64> = market
            .contracts
            .iter()
            .filter_map(|contract| {
                contract
                    .implied_probability
                    .or(contract.current_price)
                    .filter(|p| p.is_finite())
                    .map(|p| (contract.name.clone(), p.clamp(0.0, 1.0)))
            })
            .collect();
        if prices.is_empty() {
            return None;
        }
        Some(ForecastOutput {
            market_id: market.market_id.clone(),
            outcome_prices: prices,
            reasoning: "Market-implied probabilities from current contract prices".to_string(),
            score: None,
            artifact_uri: None,
            diagnostics: Some(json!({"source": "contract_prices"})),
        })
    }
}

#[async_trait]
impl ForecastStrategy for MarketImplied {
    fn info(&self) -> StrategyInfo {
        StrategyInfo {
            name: MARKET_IMPLIED.to_string(),
            version: "1.0".to_string(),
            description: Some("Contract prices taken as outcome probabilities".to_string()),
            shared_identity: None,
        }
    }

    fn requires(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run(
        &self,
        group: &EventMarketGroup,
        _research: &ResearchInputs,
        _ctx: &StrategyContext<'_>,
    ) -> StrategyOutcome<Vec<ForecastOutput>> {
        let outputs: Vec<ForecastOutput> = group
            .markets
            .iter()
            .filter_map(|market| {
                let output = Self::forecast_market(market);
                if output.is_none() {
                    debug!("Market {} has no priced contracts", market.market_id);
                }
                output
            })
            .collect();
        StrategyOutcome::Success(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NormalizedContract;

    fn contract(name: &str, price: Option<f64>, implied: Option<f64>) -> NormalizedContract {
        NormalizedContract {
            contract_id: format!("c-{name}"),
            name: name.to_string(),
            outcome_type: None,
            current_price: price,
            confidence: None,
            implied_probability: implied,
            raw_data: None,
        }
    }

    #[test]
    fn test_prefers_implied_probability() {
        let mut market = NormalizedMarket::new("m1", "q");
        market.contracts = vec![
            contract("Yes", Some(0.30), Some(0.35)),
            contract("No", Some(0.70), None),
            contract("Void", None, None),
        ];
        let output = MarketImplied::forecast_market(&market).unwrap();
        assert_eq!(output.outcome_prices.len(), 2);
        assert_eq!(output.outcome_prices["Yes"], 0.35);
        assert_eq!(output.outcome_prices["No"], 0.70);
    }

    #[test]
    fn test_unpriced_market_is_skipped() {
        let market = NormalizedMarket::new("m2", "q");
        assert!(MarketImplied::forecast_market(&market).is_none());
    }
}
