//! Layered resolution of provider, model, request options, and tools for one
//! strategy invocation.

use crate::config::Overrides;
use crate::error::ExecutionError;
use crate::experiments::strategy::{Stage, StrategyContext, StrategyError};
use crate::llm::provider::{ChatMessage, LlmProvider, LlmRequest, LlmResponse};
use serde_json::{json, Value};
use std::sync::Arc;

/// Strategy-level defaults, layered between provider defaults and overrides
#[derive(Debug, Clone, Default)]
pub struct LlmDefaults {
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    /// Tried after `default_model`, before the provider's own default
    pub fallback_model: Option<String>,
    pub default_tools: Option<Vec<Value>>,
    pub default_request_options: Overrides,
    pub require_api_key: bool,
}

impl LlmDefaults {
    pub fn new() -> Self {
        Self {
            require_api_key: true,
            ..Self::default()
        }
    }
}

/// Resolved request bound to a provider
#[derive(Clone)]
pub struct ResolvedLlmRequest {
    pub provider: Arc<dyn LlmProvider>,
    pub provider_name: String,
    pub model: String,
    pub request_options: Overrides,
    pub tools: Option<Vec<Value>>,
    pub overrides: Overrides,
    pub run_id: String,
    pub experiment_name: String,
    pub strategy_name: String,
    pub stage: Stage,
}

impl std::fmt::Debug for ResolvedLlmRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedLlmRequest")
            .field("provider", &self.provider_name)
            .field("model", &self.model)
            .field("request_options", &self.request_options)
            .field("tools", &self.tools)
            .field("experiment_name", &self.experiment_name)
            .finish()
    }
}

impl ResolvedLlmRequest {
    /// Request options with `extra` layered on top
    pub fn merge_options(&self, extra: Overrides) -> Overrides {
        let mut merged = self.request_options.clone();
        merged.extend(extra);
        merged
    }

    pub fn json_mode_options(&self, schema_name: &str, schema: &Value) -> Result<Overrides, ExecutionError> {
        self.provider.json_mode_options(schema_name, schema)
    }

    pub async fn invoke(
        &self,
        messages: Vec<ChatMessage>,
        options: Overrides,
    ) -> Result<LlmResponse, ExecutionError> {
        let request = LlmRequest {
            model: self.model.clone(),
            messages,
            options,
            tools: self.tools.clone(),
            overrides: self.overrides.clone(),
            run_id: self.run_id.clone(),
            experiment_name: self.experiment_name.clone(),
            strategy_name: self.strategy_name.clone(),
            stage: self.stage,
        };
        Ok(self.provider.invoke(&request).await?)
    }

    pub fn extract_json(&self, response: &LlmResponse) -> Result<Value, ExecutionError> {
        self.provider.extract_json(response)
    }

    pub fn usage(&self, response: &LlmResponse) -> Option<Value> {
        self.provider.usage(response)
    }

    /// Model and provider metadata, plus usage and extra keys when present
    pub fn diagnostics(&self, usage: Option<Value>, extra: Overrides) -> Value {
        let mut payload = json!({
            "model": self.model,
            "provider": self.provider_name,
        });
        if let Some(map) = payload.as_object_mut() {
            if let Some(usage) = usage.filter(|u| !u.is_null()) {
                map.insert("usage".to_string(), usage);
            }
            map.extend(extra);
        }
        payload
    }
}

fn non_empty_str<'a>(overrides: &'a Overrides, key: &str) -> Option<&'a str> {
    overrides
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Provider: override, then strategy default, then the configured global default
pub fn resolve_provider_name(ctx: &StrategyContext<'_>, defaults: &LlmDefaults) -> String {
    non_empty_str(&ctx.overrides, "provider")
        .map(str::to_string)
        .or_else(|| defaults.default_provider.clone())
        .unwrap_or_else(|| ctx.run.llm.config.default_provider.clone())
        .trim()
        .to_lowercase()
}

pub fn resolve_model(
    stage: Stage,
    provider_name: &str,
    provider: &dyn LlmProvider,
    overrides: &Overrides,
    defaults: &LlmDefaults,
    experiment_name: &str,
) -> Result<String, ExecutionError> {
    let candidate_keys = [
        format!("{}_model", stage.as_str()),
        "model".to_string(),
        format!("{provider_name}_model"),
        "llm_model".to_string(),
    ];
    for key in &candidate_keys {
        if let Some(model) = non_empty_str(overrides, key) {
            return Ok(model.to_string());
        }
    }
    defaults
        .default_model
        .clone()
        .or_else(|| defaults.fallback_model.clone())
        .or_else(|| provider.default_model(stage))
        .ok_or_else(|| {
            ExecutionError::new(format!(
                "No model configured for experiment '{experiment_name}'. Provide an override or fallback model."
            ))
        })
}

/// provider defaults < strategy defaults < `{stage}_request_options` < `request_options`
pub fn merge_request_options(
    stage: Stage,
    provider: &dyn LlmProvider,
    overrides: &Overrides,
    defaults: &LlmDefaults,
) -> Overrides {
    let mut merged = provider.default_request_options(stage);
    merged.extend(defaults.default_request_options.clone());
    let stage_key = format!("{}_request_options", stage.as_str());
    for key in [stage_key.as_str(), "request_options"] {
        if let Some(Value::Object(layer)) = overrides.get(key) {
            merged.extend(layer.clone());
        }
    }
    merged
}

/// `{stage}_tools`, then `tools`; an explicit empty list disables tools
pub fn resolve_tools(
    stage: Stage,
    provider: &dyn LlmProvider,
    overrides: &Overrides,
    defaults: &LlmDefaults,
) -> Option<Vec<Value>> {
    let stage_key = format!("{}_tools", stage.as_str());
    for key in [stage_key.as_str(), "tools"] {
        if let Some(Value::Array(tools)) = overrides.get(key) {
            return Some(tools.clone());
        }
    }
    defaults
        .default_tools
        .clone()
        .or_else(|| provider.default_tools(stage))
}

/// Resolve everything needed to call the model for this invocation
pub fn resolve_llm_request(
    ctx: &StrategyContext<'_>,
    defaults: &LlmDefaults,
) -> Result<ResolvedLlmRequest, StrategyError> {
    let provider_name = resolve_provider_name(ctx, defaults);
    let provider = ctx.run.llm.providers.get(&provider_name)?;

    if defaults.require_api_key {
        provider.ensure_ready(&ctx.overrides, ctx.experiment_name)?;
    }

    let model = resolve_model(
        ctx.stage,
        &provider_name,
        provider.as_ref(),
        &ctx.overrides,
        defaults,
        ctx.experiment_name,
    )?;
    let request_options = merge_request_options(ctx.stage, provider.as_ref(), &ctx.overrides, defaults);
    let tools = resolve_tools(ctx.stage, provider.as_ref(), &ctx.overrides, defaults);

    Ok(ResolvedLlmRequest {
        provider,
        provider_name,
        model,
        request_options,
        tools,
        overrides: ctx.overrides.clone(),
        run_id: ctx.run.run_id.clone(),
        experiment_name: ctx.experiment_name.to_string(),
        strategy_name: ctx.strategy_name.to_string(),
        stage: ctx.stage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmCallError;
    use crate::experiments::overrides::ExperimentOverrides;
    use crate::experiments::strategy::RunContext;
    use crate::llm::{LlmRuntime, ProviderRegistry};
    use crate::config::LlmConfig;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashMap;

    struct FakeProvider {
        name: &'static str,
        ready: bool,
    }

    #[async_trait]
    impl LlmProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn ensure_ready(&self, overrides: &Overrides, experiment_name: &str) -> Result<(), StrategyError> {
            if self.ready || overrides.contains_key("api_key") {
                Ok(())
            } else {
                Err(StrategyError::Skip(format!(
                    "FAKE_API_KEY is not configured; skipping experiment '{experiment_name}'"
                )))
            }
        }

        fn default_model(&self, stage: Stage) -> Option<String> {
            Some(format!("{}-{}", self.name, stage.as_str()))
        }

        fn default_request_options(&self, _stage: Stage) -> Overrides {
            let mut options = Overrides::new();
            options.insert("temperature".to_string(), json!(1.0));
            options.insert("max_output_tokens".to_string(), json!(100));
            options
        }

        fn default_tools(&self, stage: Stage) -> Option<Vec<Value>> {
            (stage == Stage::Research).then(|| vec![json!({"type": "web_search"})])
        }

        fn json_mode_options(&self, _schema_name: &str, _schema: &Value) -> Result<Overrides, ExecutionError> {
            Ok(Overrides::new())
        }

        async fn invoke(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmCallError> {
            Ok(LlmResponse {
                provider: self.name.to_string(),
                raw: json!({}),
                response_id: None,
            })
        }

        fn extract_json(&self, response: &LlmResponse) -> Result<Value, ExecutionError> {
            Ok(response.raw.clone())
        }

        fn usage(&self, _response: &LlmResponse) -> Option<Value> {
            None
        }
    }

    fn run_context(configured: HashMap<String, Overrides>) -> RunContext {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(FakeProvider {
            name: "openai",
            ready: false,
        }));
        providers.register(Arc::new(FakeProvider {
            name: "gemini",
            ready: true,
        }));
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        RunContext {
            run_id: "run".to_string(),
            run_date: date,
            target_date: date,
            window_days: 0,
            dry_run: true,
            llm: Arc::new(LlmRuntime::new(LlmConfig::default(), providers)),
            overrides: Arc::new(ExperimentOverrides::new(configured)),
        }
    }

    fn overrides(value: Value) -> HashMap<String, Overrides> {
        let mut map = HashMap::new();
        map.insert(
            "s:research:web".to_string(),
            value.as_object().cloned().unwrap(),
        );
        map
    }

    #[test]
    fn test_missing_key_is_skip() {
        let run = run_context(HashMap::new());
        let ctx = StrategyContext::new(&run, "s", Stage::Research, "web", "s:research:web");
        let err = resolve_llm_request(&ctx, &LlmDefaults::new()).unwrap_err();
        assert_eq!(
            err,
            StrategyError::Skip(
                "FAKE_API_KEY is not configured; skipping experiment 's:research:web'".to_string()
            )
        );
    }

    #[test]
    fn test_provider_override_and_model_order() {
        let run = run_context(overrides(json!({
            "provider": "Gemini",
            "model": "generic",
            "gemini_model": "provider-specific",
        })));
        let ctx = StrategyContext::new(&run, "s", Stage::Research, "web", "s:research:web");
        let resolved = resolve_llm_request(&ctx, &LlmDefaults::new()).unwrap();
        assert_eq!(resolved.provider_name, "gemini");
        assert_eq!(resolved.model, "generic");

        let run = run_context(overrides(json!({
            "provider": "gemini",
            "research_model": "stage-specific",
            "model": "generic",
        })));
        let ctx = StrategyContext::new(&run, "s", Stage::Research, "web", "s:research:web");
        let resolved = resolve_llm_request(&ctx, &LlmDefaults::new()).unwrap();
        assert_eq!(resolved.model, "stage-specific");
    }

    #[test]
    fn test_model_falls_back_to_strategy_then_provider() {
        let run = run_context(overrides(json!({"api_key": "k"})));
        let ctx = StrategyContext::new(&run, "s", Stage::Research, "web", "s:research:web");
        let defaults = LlmDefaults {
            fallback_model: Some("fallback".to_string()),
            ..LlmDefaults::new()
        };
        assert_eq!(resolve_llm_request(&ctx, &defaults).unwrap().model, "fallback");
        assert_eq!(
            resolve_llm_request(&ctx, &LlmDefaults::new()).unwrap().model,
            "openai-research"
        );
    }

    #[test]
    fn test_option_layering() {
        let run = run_context(overrides(json!({
            "api_key": "k",
            "research_request_options": {"temperature": 0.5, "top_p": 0.9},
            "request_options": {"top_p": 0.1},
        })));
        let ctx = StrategyContext::new(&run, "s", Stage::Research, "web", "s:research:web");
        let mut strategy_options = Overrides::new();
        strategy_options.insert("max_output_tokens".to_string(), json!(2000));
        let defaults = LlmDefaults {
            default_request_options: strategy_options,
            ..LlmDefaults::new()
        };
        let resolved = resolve_llm_request(&ctx, &defaults).unwrap();
        assert_eq!(resolved.request_options.get("temperature"), Some(&json!(0.5)));
        assert_eq!(resolved.request_options.get("top_p"), Some(&json!(0.1)));
        assert_eq!(
            resolved.request_options.get("max_output_tokens"),
            Some(&json!(2000))
        );
    }

    #[test]
    fn test_explicit_empty_tools_honored() {
        let run = run_context(overrides(json!({"api_key": "k", "tools": []})));
        let ctx = StrategyContext::new(&run, "s", Stage::Research, "web", "s:research:web");
        let resolved = resolve_llm_request(&ctx, &LlmDefaults::new()).unwrap();
        assert_eq!(resolved.tools, Some(vec![]));

        let run = run_context(overrides(json!({"api_key": "k"})));
        let ctx = StrategyContext::new(&run, "s", Stage::Research, "web", "s:research:web");
        let resolved = resolve_llm_request(&ctx, &LlmDefaults::new()).unwrap();
        assert_eq!(resolved.tools, Some(vec![json!({"type": "web_search"})]));

        let ctx = StrategyContext::new(&run, "s", Stage::Forecast, "web", "s:research:web");
        let resolved = resolve_llm_request(&ctx, &LlmDefaults::new()).unwrap();
        assert_eq!(resolved.tools, None);
    }

    #[test]
    fn test_unknown_provider_is_execution_error() {
        let run = run_context(overrides(json!({"provider": "anthropic"})));
        let ctx = StrategyContext::new(&run, "s", Stage::Research, "web", "s:research:web");
        let err = resolve_llm_request(&ctx, &LlmDefaults::new()).unwrap_err();
        assert!(matches!(err, StrategyError::Execution(e) if e.message.contains("anthropic")));
    }

    #[test]
    fn test_diagnostics_shape() {
        let run = run_context(overrides(json!({"api_key": "k"})));
        let ctx = StrategyContext::new(&run, "s", Stage::Research, "web", "s:research:web");
        let resolved = resolve_llm_request(&ctx, &LlmDefaults::new()).unwrap();
        let mut extra = Overrides::new();
        extra.insert("schema".to_string(), json!("web_search"));
        let diag = resolved.diagnostics(Some(json!({"total_tokens": 10})), extra);
        assert_eq!(diag["provider"], "openai");
        assert_eq!(diag["usage"]["total_tokens"], 10);
        assert_eq!(diag["schema"], "web_search");
    }
}
