//! Base-rate anchored briefing and the calibrated forecast that consumes it.
//!
//! The briefing records a reference class, an outside-view base rate, scenarios
//! and update triggers. The Delphi forecast asks the model for probabilities and
//! then regresses them toward a base rate taken from the contract prices:
//!
//! ```text
//! blended = 0.6 * model + 0.4 * base_rate   (base_rate alone when the model omits an outcome)
//! ```
//!
//! and renormalises the result to sum to 1.

use crate::config::Overrides;
use crate::domain::{EventMarketGroup, NormalizedMarket};
use crate::error::ExecutionError;
use crate::experiments::builtin::evidence::{ATLAS_RESEARCH_SWEEP, HORIZON_SIGNAL_TIMELINE};
use crate::experiments::builtin::prompts::format_market;
use crate::experiments::builtin::structured::{ResearchProfile, ResearchTools};
use crate::experiments::builtin::web_search::LLM_WEB_SEARCH;
use crate::experiments::strategy::{
    ForecastOutput, ForecastStrategy, ResearchInputs, StrategyContext, StrategyError,
    StrategyInfo, StrategyOutcome,
};
use crate::llm::openai::response_text;
use crate::llm::{resolve_llm_request, ChatMessage, LlmDefaults, LlmResponse};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{error, info};

pub const SUPERFORECASTER_BRIEFING: &str = "superforecaster_briefing";
pub const SUPERFORECASTER_DELPHI: &str = "superforecaster_delphi";

const MODEL_WEIGHT: f64 = 0.6;
const BASE_RATE_WEIGHT: f64 = 0.4;
const EXCERPT_CHARS: usize = 4000;

/// Research consumed when present, in prompt order
const SUPPLEMENTAL_RESEARCH: [&str; 3] = [LLM_WEB_SEARCH, ATLAS_RESEARCH_SWEEP, HORIZON_SIGNAL_TIMELINE];

pub static BRIEFING: ResearchProfile = ResearchProfile {
    kind: SUPERFORECASTER_BRIEFING,
    version: "0.1",
    description: "Structured brief that records base rates, scenario decomposition, and update triggers",
    shared_identity: None,
    system_prompt: "You are an elite superforecaster preparing a briefing for a prediction market run. \
Combine outside-view base rates with specific scenario analysis and an update plan.",
    instructions: "Review the market group information and craft a structured planning brief. \
Follow superforecaster best practices: identify an appropriate reference class, \
quantify an outside-view base rate, break the question into key scenarios, and \
list concrete indicators you will monitor to update the forecast.",
    schema: briefing_schema,
    default_provider: None,
    default_model: None,
    tools: ResearchTools::WebSearch,
    postprocess: Some(tidy_briefing),
    extra_diagnostics: Some(output_excerpt),
};

fn nullable_string(description: &str) -> Value {
    json!({"type": ["string", "null"], "description": description})
}

pub fn briefing_schema() -> (&'static str, Value) {
    let probability = json!({"type": "number", "minimum": 0, "maximum": 1});
    let schema = json!({
        "type": "object",
        "properties": {
            "reference_class": {
                "type": "string",
                "description": "Short description of the closest historical comparison"
            },
            "base_rate": {
                "type": "object",
                "properties": {
                    "probability": probability.clone(),
                    "source": {"type": "string"},
                    "notes": nullable_string("Any caveats or clarifying detail about the base rate")
                },
                "required": ["probability", "source", "notes"],
                "additionalProperties": false
            },
            "scenario_decomposition": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "description": {"type": "string"},
                        "probability": probability,
                        "impact": nullable_string("What would happen if this scenario materialises")
                    },
                    "required": ["name", "description", "probability", "impact"],
                    "additionalProperties": false
                }
            },
            "key_uncertainties": {"type": "array", "items": {"type": "string"}},
            "update_triggers": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "indicator": {"type": "string"},
                        "threshold": nullable_string("Condition or value that would prompt a reassessment"),
                        "direction": nullable_string("How the indicator should move (e.g. up/down)")
                    },
                    "required": ["indicator", "threshold", "direction"],
                    "additionalProperties": false
                }
            },
            "confidence": {
                "type": "string",
                "description": "Low/Medium/High self-assessed confidence in the current read"
            },
            "generated_at": {"type": "string"}
        },
        "required": [
            "reference_class",
            "base_rate",
            "scenario_decomposition",
            "key_uncertainties",
            "update_triggers",
            "confidence",
            "generated_at"
        ],
        "additionalProperties": false
    });
    ("SuperforecasterBriefing", schema)
}

/// Clamp a numeric field into [0, 1]; drop it when it is not a number
fn clamp_field(map: &mut Map<String, Value>, key: &str) {
    match map.get(key).and_then(Value::as_f64).filter(|p| p.is_finite()) {
        Some(p) => {
            map.insert(key.to_string(), json!(p.clamp(0.0, 1.0)));
        }
        None => {
            map.remove(key);
        }
    }
}

/// Trim a string field; drop it when it is not a string
fn trim_field(map: &mut Map<String, Value>, key: &str) {
    match map.get(key).and_then(Value::as_str).map(|s| s.trim().to_string()) {
        Some(text) => {
            map.insert(key.to_string(), Value::String(text));
        }
        None => {
            map.remove(key);
        }
    }
}

fn each_object<'a>(
    map: &'a mut Map<String, Value>,
    key: &str,
) -> impl Iterator<Item = &'a mut Map<String, Value>> {
    map.get_mut(key)
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object_mut)
}

pub fn tidy_briefing(payload: &mut Map<String, Value>) {
    if let Some(base_rate) = payload.get_mut("base_rate").and_then(Value::as_object_mut) {
        clamp_field(base_rate, "probability");
        trim_field(base_rate, "notes");
    }
    for scenario in each_object(payload, "scenario_decomposition") {
        clamp_field(scenario, "probability");
        trim_field(scenario, "impact");
    }
    for trigger in each_object(payload, "update_triggers") {
        trim_field(trigger, "threshold");
        trim_field(trigger, "direction");
    }
}

fn output_excerpt(response: &LlmResponse) -> Overrides {
    let mut extra = Overrides::new();
    if let Some(text) = response_text(&response.raw) {
        let excerpt: String = text.chars().take(EXCERPT_CHARS).collect();
        extra.insert("raw_output_excerpt".to_string(), Value::String(excerpt));
    }
    extra
}

/// Contract prices clamped to [0, 1]; a uniform share replaces any missing price
pub fn base_rates(market: &NormalizedMarket) -> BTreeMap<String, f64> {
    if market.contracts.is_empty() {
        return BTreeMap::new();
    }
    let uniform = 1.0 / market.contracts.len() as f64;
    market
        .contracts
        .iter()
        .map(|contract| {
            let price = contract
                .current_price
                .filter(|p| p.is_finite())
                .map(|p| p.clamp(0.0, 1.0))
                .unwrap_or(uniform);
            (contract.name.clone(), price)
        })
        .collect()
}

/// Weighted blend toward the base rate, renormalised; a zero total falls back to uniform
pub fn blend(
    model: &BTreeMap<String, Option<f64>>,
    base: &BTreeMap<String, f64>,
) -> BTreeMap<String, f64> {
    let blended: BTreeMap<String, f64> = base
        .iter()
        .map(|(outcome, rate)| {
            let value = match model.get(outcome).copied().flatten() {
                Some(p) => MODEL_WEIGHT * p + BASE_RATE_WEIGHT * rate,
                None => *rate,
            };
            (outcome.clone(), value)
        })
        .collect();
    let total: f64 = blended.values().sum();
    if blended.is_empty() {
        return blended;
    }
    if total <= 0.0 {
        let uniform = 1.0 / blended.len() as f64;
        return blended.into_keys().map(|k| (k, uniform)).collect();
    }
    blended.into_iter().map(|(k, v)| (k, v / total)).collect()
}

/// Calibrated forecast anchored on the superforecaster briefing
#[derive(Debug, Clone, Default)]
pub struct SuperforecasterDelphi;

impl SuperforecasterDelphi {
    pub fn new() -> Self {
        Self
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
                "market_view": {
                    "type": "string",
                    "description": "Narrative explanation grounded in the scenarios and base rate"
                },
                "confidence": {"type": "string", "description": "Low/Medium/High calibration self-rating"},
                "monitoring_plan": {"type": "array", "items": {"type": "string"}},
                "calibration_notes": {"type": "string"}
            },
            "required": ["outcomes", "market_view", "confidence", "monitoring_plan", "calibration_notes"],
            "additionalProperties": false
        });
        (format!("SuperforecasterForecast_{}", market.market_id), schema)
    }

    fn messages(market: &NormalizedMarket, briefing: &Value, supplemental: &[(&str, &Value)]) -> Vec<ChatMessage> {
        let pretty = |v: &Value| serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string());
        let supplemental = if supplemental.is_empty() {
            "(none)".to_string()
        } else {
            supplemental
                .iter()
                .map(|(name, payload)| format!("{name}:\n{}", pretty(payload)))
                .collect::<Vec<_>>()
                .join("\n\n")
        };
        let system = "You are a disciplined superforecaster. Anchor to the base rate, incorporate scenario \
analysis, and make explicit, numerically calibrated probability updates.";
        let user = format!(
            "Market details:\n{}\n\nSuperforecaster briefing JSON:\n{}\n\nAdditional research artifacts:\n{supplemental}\n\n\
Instructions:\n\
1. Start from the base rate in the briefing and adjust using the scenarios.\n\
2. Explain how each adjustment changes the odds. Reference evidence or monitoring triggers.\n\
3. Output calibrated probabilities (0-1) for every outcome that sum to 1.\n\
4. Provide a concise market_view narrative and list key monitoring actions.",
            format_market(market, false),
            pretty(briefing)
        );
        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }

    async fn forecast(
        &self,
        group: &EventMarketGroup,
        research: &ResearchInputs,
        ctx: &StrategyContext<'_>,
    ) -> Result<Vec<ForecastOutput>, StrategyError> {
        let runtime = resolve_llm_request(ctx, &LlmDefaults::new())?;

        let briefing = research
            .get(SUPERFORECASTER_BRIEFING)
            .map(|artifact| &artifact.payload)
            .filter(|payload| !payload.is_null())
            .ok_or_else(|| ExecutionError::new("Superforecaster forecast missing required briefing artifact"))?;
        let supplemental: Vec<(&str, &Value)> = SUPPLEMENTAL_RESEARCH
            .iter()
            .filter_map(|name| {
                research
                    .get(*name)
                    .map(|artifact| (*name, &artifact.payload))
                    .filter(|(_, payload)| !payload.is_null())
            })
            .collect();

        let mut outputs = Vec::with_capacity(group.markets.len());
        for market in &group.markets {
            if market.contracts.is_empty() {
                info!("Market {} has no contracts; skipping superforecaster forecast", market.market_id);
                continue;
            }

            let (schema_name, schema) = Self::schema(market);
            let options = runtime.merge_options(runtime.json_mode_options(&schema_name, &schema)?);
            let response = runtime
                .invoke(Self::messages(market, briefing, &supplemental), options)
                .await
                .map_err(|err| {
                    error!(
                        "Superforecaster forecast request failed for {} market {}: {}",
                        ctx.experiment_name, market.market_id, err
                    );
                    err
                })?;
            let payload = runtime.extract_json(&response)?;

            let mut raw = BTreeMap::new();
            let mut rationales = Vec::new();
            for contract in &market.contracts {
                let entry = payload.get("outcomes").and_then(|o| o.get(&contract.name));
                let probability = entry
                    .and_then(|e| e.get("probability"))
                    .and_then(Value::as_f64)
                    .filter(|p| p.is_finite())
                    .map(|p| p.clamp(0.0, 1.0));
                raw.insert(contract.name.clone(), probability);
                if let Some(r) = entry
                    .and_then(|e| e.get("rationale"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                {
                    rationales.push(format!("{}: {r}", contract.name));
                }
            }

            let anchors = base_rates(market);
            let normalized = blend(&raw, &anchors);
            let monitoring_plan = payload.get("monitoring_plan").cloned().unwrap_or(Value::Null);

            let mut extra = Overrides::new();
            extra.insert(
                "confidence".to_string(),
                payload.get("confidence").cloned().unwrap_or(Value::Null),
            );
            extra.insert("raw_probabilities".to_string(), json!(raw));
            extra.insert("base_rate_probabilities".to_string(), json!(anchors));
            extra.insert("normalized_probabilities".to_string(), json!(normalized));
            extra.insert(
                "blend_weights".to_string(),
                json!({"model": MODEL_WEIGHT, "base_rate": BASE_RATE_WEIGHT}),
            );
            extra.insert("monitoring_plan".to_string(), monitoring_plan);

            outputs.push(ForecastOutput {
                market_id: market.market_id.clone(),
                reasoning: reasoning(&payload, &rationales, &anchors),
                outcome_prices: normalized,
                score: None,
                artifact_uri: None,
                diagnostics: Some(runtime.diagnostics(runtime.usage(&response), extra)),
            });
        }
        Ok(outputs)
    }
}

fn non_blank<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn reasoning(payload: &Value, rationales: &[String], anchors: &BTreeMap<String, f64>) -> String {
    let mut sections = Vec::new();
    if let Some(view) = non_blank(payload, "market_view") {
        sections.push(view.to_string());
    }
    if !rationales.is_empty() {
        sections.push(format!("Key rationales:\n{}", rationales.join("\n")));
    }
    if !anchors.is_empty() {
        let anchor = anchors
            .iter()
            .map(|(name, value)| format!("{name}={value:.2}"))
            .collect::<Vec<_>>()
            .join(", ");
        sections.push(format!(
            "Probabilities regressed 40% toward base-rate anchor ({anchor}) to mirror superforecaster calibration."
        ));
    }
    if let Some(notes) = non_blank(payload, "calibration_notes") {
        sections.push(format!("Calibration notes: {notes}"));
    }
    let plan: Vec<String> = payload
        .get("monitoring_plan")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter(|item| !item.is_empty())
        .map(|item| format!("- {item}"))
        .collect();
    if !plan.is_empty() {
        sections.push(format!("Monitoring plan:\n{}", plan.join("\n")));
    }
    if sections.is_empty() {
        "Superforecaster-calibrated forecast.".to_string()
    } else {
        sections.join("\n\n")
    }
}

#[async_trait]
impl ForecastStrategy for SuperforecasterDelphi {
    fn info(&self) -> StrategyInfo {
        StrategyInfo {
            name: SUPERFORECASTER_DELPHI.to_string(),
            version: "0.1".to_string(),
            description: Some("Superforecaster-inspired prompt with base-rate regression".to_string()),
            shared_identity: None,
        }
    }

    fn requires(&self) -> Vec<String> {
        vec![SUPERFORECASTER_BRIEFING.to_string()]
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
    use crate::config::LlmConfig;
    use crate::domain::NormalizedContract;
    use crate::experiments::overrides::ExperimentOverrides;
    use crate::experiments::strategy::{ResearchOutput, RunContext, Stage};
    use crate::experiments::testing::ScriptedProvider;
    use crate::llm::openai::validate_required_fields;
    use crate::llm::{LlmRuntime, ProviderRegistry};
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn market(prices: &[Option<f64>]) -> NormalizedMarket {
        let mut market = NormalizedMarket::new("m1", "Will it happen?");
        for (i, (name, price)) in ["Yes", "No"].iter().zip(prices).enumerate() {
            market.contracts.push(NormalizedContract {
                contract_id: format!("m1-{i}"),
                name: name.to_string(),
                outcome_type: None,
                current_price: *price,
                confidence: None,
                implied_probability: None,
                raw_data: None,
            });
        }
        market
    }

    fn run_context(provider: Arc<ScriptedProvider>) -> RunContext {
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        RunContext {
            run_id: "run".to_string(),
            run_date: date,
            target_date: date,
            window_days: 1,
            dry_run: true,
            llm: Arc::new(LlmRuntime::new(LlmConfig::default(), providers)),
            overrides: Arc::new(ExperimentOverrides::new(HashMap::new())),
        }
    }

    #[test]
    fn test_schemas_satisfy_structured_output_rules() {
        let (name, schema) = briefing_schema();
        assert!(validate_required_fields(name, &schema, "").is_ok());
        let (name, schema) = SuperforecasterDelphi::schema(&market(&[Some(0.5), Some(0.5)]));
        assert_eq!(name, "SuperforecasterForecast_m1");
        assert!(validate_required_fields(&name, &schema, "").is_ok());
    }

    #[test]
    fn test_briefing_is_clamped_and_trimmed() {
        let mut payload = json!({
            "base_rate": {"probability": 1.7, "source": "history", "notes": "  caveat  "},
            "scenario_decomposition": [
                {"name": "a", "probability": -0.2, "impact": null},
                {"name": "b", "probability": "high", "impact": " big "}
            ],
            "update_triggers": [{"indicator": "polls", "threshold": " 5pt ", "direction": 3}]
        });
        tidy_briefing(payload.as_object_mut().unwrap());

        assert_eq!(payload["base_rate"], json!({"probability": 1.0, "source": "history", "notes": "caveat"}));
        assert_eq!(payload["scenario_decomposition"][0], json!({"name": "a", "probability": 0.0}));
        assert_eq!(payload["scenario_decomposition"][1], json!({"name": "b", "impact": "big"}));
        assert_eq!(payload["update_triggers"][0], json!({"indicator": "polls", "threshold": "5pt"}));
    }

    #[test]
    fn test_base_rates_fall_back_to_uniform_for_missing_prices() {
        let anchors = base_rates(&market(&[Some(1.4), None]));
        assert_eq!(anchors["Yes"], 1.0);
        assert_eq!(anchors["No"], 0.5);
    }

    #[test]
    fn test_blend_regresses_toward_base_rate() {
        let base: BTreeMap<String, f64> = [("Yes".to_string(), 0.5), ("No".to_string(), 0.5)].into();
        let model: BTreeMap<String, Option<f64>> =
            [("Yes".to_string(), Some(0.9)), ("No".to_string(), Some(0.1))].into();
        let blended = blend(&model, &base);
        assert!((blended["Yes"] - 0.74).abs() < 1e-9);
        assert!((blended["No"] - 0.26).abs() < 1e-9);

        let partial: BTreeMap<String, Option<f64>> = [("Yes".to_string(), Some(1.0))].into();
        let blended = blend(&partial, &base);
        // 0.8 and 0.5 before normalising
        assert!((blended["Yes"] - 0.8 / 1.3).abs() < 1e-9);

        let zero: BTreeMap<String, f64> = [("Yes".to_string(), 0.0), ("No".to_string(), 0.0)].into();
        let empty_model: BTreeMap<String, Option<f64>> = BTreeMap::new();
        assert_eq!(blend(&empty_model, &zero)["No"], 0.5);
    }

    #[tokio::test]
    async fn test_forecast_blends_and_explains() {
        let provider = Arc::new(ScriptedProvider::new(
            "openai",
            json!({
                "outcomes": {
                    "Yes": {"probability": 0.9, "rationale": "momentum"},
                    "No": {"probability": 0.1, "rationale": ""}
                },
                "market_view": "Leaning yes.",
                "confidence": "Medium",
                "monitoring_plan": ["polls", ""],
                "calibration_notes": "tempered"
            }),
        ));
        let run = run_context(Arc::clone(&provider));
        let ctx = StrategyContext::new(&run, "superforecaster", Stage::Forecast, "d", "superforecaster:forecast:d");
        let mut research = ResearchInputs::new();
        research.insert(
            SUPERFORECASTER_BRIEFING.to_string(),
            Arc::new(ResearchOutput::new(json!({"reference_class": "elections"}))),
        );
        research.insert(
            ATLAS_RESEARCH_SWEEP.to_string(),
            Arc::new(ResearchOutput::new(json!({"bullish": ["x"]}))),
        );
        let group = EventMarketGroup::new(None, vec![market(&[Some(0.5), Some(0.5)])]);

        let outcome = SuperforecasterDelphi::new().run(&group, &research, &ctx).await;
        let StrategyOutcome::Success(outputs) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        let output = &outputs[0];
        assert!((output.outcome_prices["Yes"] - 0.74).abs() < 1e-9);
        assert_eq!(
            output.reasoning,
            "Leaning yes.\n\nKey rationales:\nYes: momentum\n\n\
Probabilities regressed 40% toward base-rate anchor (No=0.50, Yes=0.50) to mirror superforecaster calibration.\n\n\
Calibration notes: tempered\n\nMonitoring plan:\n- polls"
        );
        let diagnostics = output.diagnostics.as_ref().unwrap();
        assert_eq!(diagnostics["blend_weights"], json!({"model": 0.6, "base_rate": 0.4}));
        assert_eq!(diagnostics["raw_probabilities"]["Yes"], json!(0.9));
        assert_eq!(diagnostics["confidence"], "Medium");

        let prompt = &provider.last_request().unwrap().messages[1].content;
        assert!(prompt.contains("\"reference_class\": \"elections\""));
        assert!(prompt.contains("atlas_research_sweep:\n"));
        assert!(!prompt.contains("(none)"));
    }

    #[tokio::test]
    async fn test_forecast_without_briefing_fails() {
        let run = run_context(Arc::new(ScriptedProvider::new("openai", json!({}))));
        let ctx = StrategyContext::new(&run, "superforecaster", Stage::Forecast, "d", "superforecaster:forecast:d");
        let group = EventMarketGroup::new(None, vec![market(&[Some(0.5), Some(0.5)])]);
        let outcome = SuperforecasterDelphi::new()
            .run(&group, &ResearchInputs::new(), &ctx)
            .await;
        let StrategyOutcome::Failed(err) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(err.message, "Superforecaster forecast missing required briefing artifact");
    }
}
