use crate::config::Overrides;
use crate::domain::{EventMarketGroup, NormalizedMarket};
use crate::error::ExecutionError;
use crate::experiments::builtin::prompts::format_market;
use crate::experiments::strategy::{
    ForecastOutput, ForecastStrategy, ResearchInputs, StrategyContext, StrategyError,
    StrategyInfo, StrategyOutcome,
};
use crate::llm::{resolve_llm_request, ChatMessage, LlmDefaults};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{error, info};

pub const LLM_FORECAST: &str = "llm_forecast";
pub const GEMINI_FORECAST: &str = "gemini_forecast";

/// Allowed distance of the probability sum from 1 before renormalising
const SUM_TOLERANCE: f64 = 0.05;

const SYSTEM_PROMPT: &str =
    "You are a probabilistic forecaster. Use the provided research to produce calibrated outcome probabilities.";

/// JSON-mode forecast over the research artifacts of its dependencies
#[derive(Debug, Clone)]
pub struct LlmForecast {
    requires: Vec<String>,
    name: &'static str,
    version: &'static str,
    description: &'static str,
    default_provider: Option<&'static str>,
    default_model: Option<&'static str>,
}

impl LlmForecast {
    /// `requires` must name at least one research strategy; suite definitions check this
    pub fn new(requires: Vec<String>) -> Self {
        Self {
            requires,
            name: LLM_FORECAST,
            version: "0.2",
            description: "JSON-mode forecast prompt over research artifacts",
            default_provider: None,
            default_model: None,
        }
    }

    /// Same prompt served by Gemini 2.5 Pro
    pub fn gemini(requires: Vec<String>) -> Self {
        Self {
            requires,
            name: GEMINI_FORECAST,
            version: "0.1",
            description: "JSON-mode forecast prompt using Gemini 2.5 Pro",
            default_provider: Some("gemini"),
            default_model: Some("gemini-2.5-pro"),
        }
    }

    fn defaults(&self) -> LlmDefaults {
        LlmDefaults {
            default_provider: self.default_provider.map(str::to_string),
            default_model: self.default_model.map(str::to_string),
            ..LlmDefaults::new()
        }
    }

    pub fn schema(market: &NormalizedMarket) -> (String, Value) {
        let mut outcomes = Map::new();
        let mut required = Vec::with_capacity(market.contracts.len());
        for contract in &market.contracts {
            outcomes.insert(
                contract.name.clone(),
                json!({
                    "type": "object",
                    "properties": {
                        "probability": {"type": "number", "minimum": 0, "maximum": 1},
                        "rationale": {"type": "string"}
                    },
                    "required": ["probability", "rationale"],
                    "additionalProperties": false
                }),
            );
            required.push(Value::String(contract.name.clone()));
        }
        let schema = json!({
            "type": "object",
            "properties": {
                "outcomes": {
                    "type": "object",
                    "properties": outcomes,
                    "required": required,
                    "additionalProperties": false
                },
                "market_view": {"type": "string", "description": "Narrative explanation for the allocation"},
                "confidence": {"type": "string", "description": "Low/Medium/High confidence flag"}
            },
            "required": ["outcomes", "market_view", "confidence"],
            "additionalProperties": false
        });
        (format!("MarketForecast_{}", market.market_id), schema)
    }

    fn messages(
        market: &NormalizedMarket,
        research: &[(&str, &Value)],
        research_date: NaiveDate,
    ) -> Vec<ChatMessage> {
        let context = research
            .iter()
            .map(|(name, payload)| {
                let body = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
                format!("Research ({name}):\n{body}")
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let context = if context.is_empty() {
            "No research supplied.".to_string()
        } else {
            context
        };
        let user = format!(
            "The latest research artifacts were generated on {research_date}.\n\n\
Produce probabilities that sum to 1 for the market's outcomes. Reference the research evidence in your rationale.\n\n\
Market context:\n{}\n\nResearch context:\n{context}",
            format_market(market, false)
        );
        vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
    }

    async fn forecast(
        &self,
        group: &EventMarketGroup,
        research: &ResearchInputs,
        ctx: &StrategyContext<'_>,
    ) -> Result<Vec<ForecastOutput>, StrategyError> {
        let runtime = resolve_llm_request(ctx, &self.defaults())?;

        let mut inputs: Vec<(&str, &Value)> = Vec::with_capacity(self.requires.len());
        let mut dates = Vec::new();
        for name in &self.requires {
            let artifact = research.get(name).ok_or_else(|| {
                ExecutionError::new(format!(
                    "Forecast '{}' missing required research artifact '{name}'",
                    ctx.strategy_name
                ))
            })?;
            if let Some(date) = generated_on(&artifact.payload) {
                dates.push(date);
            }
            inputs.push((name.as_str(), &artifact.payload));
        }
        let research_date = dates.into_iter().max().unwrap_or(ctx.run.run_date);

        let mut outputs = Vec::with_capacity(group.markets.len());
        for market in &group.markets {
            if market.contracts.is_empty() {
                info!("Market {} has no contracts; skipping forecast", market.market_id);
                continue;
            }

            let (schema_name, schema) = Self::schema(market);
            let options = runtime.merge_options(runtime.json_mode_options(&schema_name, &schema)?);
            let response = runtime
                .invoke(Self::messages(market, &inputs, research_date), options)
                .await
                .map_err(|err| {
                    error!(
                        "LLM forecast request failed for {} market {}: {}",
                        ctx.experiment_name, market.market_id, err
                    );
                    err
                })?;
            let payload = runtime.extract_json(&response)?;

            let (outcome_prices, rationales) = read_outcomes(market, &payload);
            let reasoning = payload
                .get("market_view")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| {
                    if rationales.is_empty() {
                        format!("Forecast generated via {}", runtime.model)
                    } else {
                        rationales.join("\n")
                    }
                });

            let mut extra = Overrides::new();
            extra.insert(
                "confidence".to_string(),
                payload.get("confidence").cloned().unwrap_or(Value::Null),
            );
            outputs.push(ForecastOutput {
                market_id: market.market_id.clone(),
                outcome_prices: normalize_probabilities(outcome_prices),
                reasoning,
                score: None,
                artifact_uri: None,
                diagnostics: Some(runtime.diagnostics(runtime.usage(&response), extra)),
            });
        }
        Ok(outputs)
    }
}

/// Date part of a research payload's `generated_at`
fn generated_on(payload: &Value) -> Option<NaiveDate> {
    let raw = payload.get("generated_at")?.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
}

fn read_outcomes(market: &NormalizedMarket, payload: &Value) -> (BTreeMap<String, f64>, Vec<String>) {
    let mut prices = BTreeMap::new();
    let mut rationales = Vec::new();
    let outcomes = payload.get("outcomes");
    for contract in &market.contracts {
        let Some(entry) = outcomes.and_then(|o| o.get(&contract.name)) else {
            continue;
        };
        if let Some(p) = entry.get("probability").and_then(Value::as_f64) {
            prices.insert(contract.name.clone(), p);
        }
        if let Some(r) = entry
            .get("rationale")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty())
        {
            rationales.push(format!("{}: {r}", contract.name));
        }
    }
    (prices, rationales)
}

/// Clamp to [0, 1], then rescale when the total drifts too far from 1
pub fn normalize_probabilities(prices: BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let clamped: BTreeMap<String, f64> = prices
        .into_iter()
        .filter(|(_, p)| p.is_finite())
        .map(|(name, p)| (name, p.clamp(0.0, 1.0)))
        .collect();
    let total: f64 = clamped.values().sum();
    if total > 0.0 && (total - 1.0).abs() > SUM_TOLERANCE {
        clamped.into_iter().map(|(name, p)| (name, p / total)).collect()
    } else {
        clamped
    }
}

#[async_trait]
impl ForecastStrategy for LlmForecast {
    fn info(&self) -> StrategyInfo {
        StrategyInfo {
            name: self.name.to_string(),
            version: self.version.to_string(),
            description: Some(self.description.to_string()),
            shared_identity: None,
        }
    }

    fn requires(&self) -> Vec<String> {
        self.requires.clone()
    }

    async fn run(
        &self,
        group: &EventMarketGroup,
        research: &ResearchInputs,
        ctx: &StrategyContext<'_>,
    ) -> StrategyOutcome<Vec<ForecastOutput>> {
        self.forecast(group, research, ctx).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NormalizedContract;
    use crate::llm::openai::validate_required_fields;

    fn market() -> NormalizedMarket {
        let mut market = NormalizedMarket::new("m1", "Will it happen?");
        for (i, name) in ["Yes", "No"].iter().enumerate() {
            market.contracts.push(NormalizedContract {
                contract_id: format!("m1-{i}"),
                name: name.to_string(),
                outcome_type: None,
                current_price: Some(0.5),
                confidence: None,
                implied_probability: None,
                raw_data: None,
            });
        }
        market
    }

    #[test]
    fn test_schema_lists_every_outcome() {
        let (name, schema) = LlmForecast::schema(&market());
        assert_eq!(name, "MarketForecast_m1");
        assert_eq!(schema["properties"]["outcomes"]["required"], json!(["Yes", "No"]));
        assert!(validate_required_fields(&name, &schema, "").is_ok());
    }

    #[test]
    fn test_probabilities_are_clamped_and_renormalised() {
        let mut prices = BTreeMap::new();
        prices.insert("Yes".to_string(), 1.4);
        prices.insert("No".to_string(), 0.6);
        let normalized = normalize_probabilities(prices);
        assert!((normalized["Yes"] - 0.625).abs() < 1e-9);
        assert!((normalized["No"] - 0.375).abs() < 1e-9);

        let mut close = BTreeMap::new();
        close.insert("Yes".to_string(), 0.52);
        close.insert("No".to_string(), 0.50);
        let kept = normalize_probabilities(close);
        assert_eq!(kept["Yes"], 0.52);
        assert_eq!(kept["No"], 0.50);
    }

    #[test]
    fn test_outcomes_and_rationales_are_read_per_contract() {
        let payload = json!({
            "outcomes": {
                "Yes": {"probability": 0.7, "rationale": "polls"},
                "No": {"probability": 0.3, "rationale": " "}
            },
            "market_view": ""
        });
        let (prices, rationales) = read_outcomes(&market(), &payload);
        assert_eq!(prices["Yes"], 0.7);
        assert_eq!(prices["No"], 0.3);
        assert_eq!(rationales, vec!["Yes: polls".to_string()]);
    }

    #[test]
    fn test_gemini_variant_defaults_to_gemini_pro() {
        let forecast = LlmForecast::gemini(vec!["gemini_web_search".to_string()]);
        let info = forecast.info();
        assert_eq!(info.name, GEMINI_FORECAST);
        assert_eq!(info.version, "0.1");
        let defaults = forecast.defaults();
        assert_eq!(defaults.default_provider.as_deref(), Some("gemini"));
        assert_eq!(defaults.default_model.as_deref(), Some("gemini-2.5-pro"));
        assert!(defaults.require_api_key);
        assert!(LlmForecast::new(Vec::new()).defaults().default_model.is_none());
    }

    #[test]
    fn test_research_date_parsing() {
        assert_eq!(
            generated_on(&json!({"generated_at": "2025-03-04T10:00:00Z"})),
            NaiveDate::from_ymd_opt(2025, 3, 4)
        );
        assert_eq!(
            generated_on(&json!({"generated_at": "2025-03-05"})),
            NaiveDate::from_ymd_opt(2025, 3, 5)
        );
        assert_eq!(generated_on(&json!({"summary": "x"})), None);
    }
}
