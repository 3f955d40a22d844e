//! Google Gemini `generateContent` provider.
//!
//! Requests are non-streaming. Each attempt uses the next configured API key, so a
//! rate-limited key is rotated out on retry.

use crate::config::{GeminiConfig, Overrides};
use crate::error::{ExecutionError, LlmCallError, LlmErrorKind, PipelineError, TransportMode};
use crate::experiments::strategy::{Stage, StrategyError};
use crate::llm::provider::{ChatMessage, LlmProvider, LlmRequest, LlmResponse};
use crate::llm::retry::{call_with_retry, AttemptError, AttemptPlan, RetryPolicy};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::warn;

const GENERATION_KEYS: [&str; 4] = ["temperature", "top_p", "top_k", "max_output_tokens"];
const MAX_ERROR_BODY: usize = 500;

pub struct GeminiProvider {
    config: GeminiConfig,
    retry: RetryPolicy,
    client: Client,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig, retry: RetryPolicy) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            retry,
            client,
        })
    }

    /// Candidate keys in rotation order, without blanks or duplicates
    pub fn api_keys(&self, overrides: &Overrides) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let mut push = |key: &str| {
            let key = key.trim();
            if !key.is_empty() && !keys.iter().any(|k| k == key) {
                keys.push(key.to_string());
            }
        };

        if let Some(key) = overrides.get("api_key").and_then(Value::as_str) {
            push(key);
        }
        match overrides.get("api_keys") {
            Some(Value::String(key)) => push(key.as_str()),
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).for_each(&mut push),
            _ => {}
        }
        if let Some(key) = &self.config.api_key {
            push(key.as_str());
        }
        for key in &self.config.additional_api_keys {
            push(key.as_str());
        }
        keys
    }

    fn base_url<'a>(&'a self, overrides: &'a Overrides) -> &'a str {
        overrides
            .get("api_base")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(self.config.base_url.as_str())
            .trim_end_matches('/')
    }

    async fn attempt(
        &self,
        url: &str,
        keys: &[String],
        payload: &Value,
        plan: AttemptPlan,
    ) -> Result<LlmResponse, AttemptError> {
        let index = (plan.attempt.saturating_sub(1) as usize) % keys.len();
        let key = &keys[index];

        match self.send(url, key, payload).await {
            Err(err) if is_search_grounding_rejection(&err) && payload.get("tools").is_some() => {
                warn!(
                    "Gemini rejected search grounding (status={:?}); retrying without tools",
                    err.status
                );
                let mut stripped = payload.clone();
                if let Some(map) = stripped.as_object_mut() {
                    map.remove("tools");
                }
                self.send(url, key, &stripped).await
            }
            other => other,
        }
    }

    async fn send(&self, url: &str, key: &str, payload: &Value) -> Result<LlmResponse, AttemptError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", key)
            .json(payload)
            .send()
            .await
            .map_err(|e| AttemptError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(AttemptError::http_status(status.as_u16(), None, message));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| AttemptError::from_reqwest(&e))?;
        let response_id = raw
            .get("responseId")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(LlmResponse {
            provider: self.name().to_string(),
            raw,
            response_id,
        })
    }
}

fn is_search_grounding_rejection(err: &AttemptError) -> bool {
    if err.status != Some(400) {
        return false;
    }
    let message = err.message.to_lowercase();
    message.contains("google_search") || message.contains("search grounding") || message.contains("search_retrieval")
}

/// Map chat messages onto `systemInstruction` and `contents`
fn build_contents(messages: &[ChatMessage]) -> (Option<Value>, Vec<Value>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect();
    let instruction = (!system.is_empty()).then(|| json!({"parts": [{"text": system.join("\n\n")}]}));

    let contents = messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| {
            let role = if m.role == "assistant" { "model" } else { "user" };
            json!({"role": role, "parts": [{"text": m.content}]})
        })
        .collect();
    (instruction, contents)
}

/// Collapse the accepted search tool spellings onto `google_search_retrieval`
pub fn normalize_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let Some(map) = tool.as_object() else {
                return tool.clone();
            };
            for key in ["google_search", "google_search_retrieval"] {
                if let Some(inner) = map.get(key) {
                    let inner = if inner.is_object() { inner.clone() } else { json!({}) };
                    return json!({"google_search_retrieval": inner});
                }
            }
            match map.get("type").and_then(Value::as_str) {
                Some("google_search") | Some("google_search_retrieval") | Some("web_search") => {
                    json!({"google_search_retrieval": {}})
                }
                _ => tool.clone(),
            }
        })
        .collect()
}

/// Request body for `generateContent`
pub fn build_payload(request: &LlmRequest) -> Value {
    let (instruction, contents) = build_contents(&request.messages);
    let mut payload = Map::new();
    payload.insert("contents".to_string(), Value::Array(contents));
    if let Some(instruction) = instruction {
        payload.insert("systemInstruction".to_string(), instruction);
    }

    let mut generation = Map::new();
    for key in GENERATION_KEYS {
        if let Some(value) = request.options.get(key) {
            generation.insert(key.to_string(), value.clone());
        }
    }
    if let Some(extra) = request.options.get("generation_config").and_then(Value::as_object) {
        for (key, value) in extra {
            generation.insert(key.clone(), value.clone());
        }
    }
    if !generation.is_empty() {
        payload.insert("generation_config".to_string(), Value::Object(generation));
    }

    if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
        payload.insert("tools".to_string(), Value::Array(normalize_tools(tools)));
    }
    Value::Object(payload)
}

/// Drop schema keywords Gemini rejects and uppercase type names
pub fn prune_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut pruned = Map::new();
            for (key, value) in map {
                match key.as_str() {
                    "additionalProperties" | "minimum" | "maximum" => {}
                    "type" => {
                        let upper = match value {
                            Value::String(t) => Value::String(t.to_uppercase()),
                            other => prune_schema(other),
                        };
                        pruned.insert(key.clone(), upper);
                    }
                    _ => {
                        pruned.insert(key.clone(), prune_schema(value));
                    }
                }
            }
            Value::Object(pruned)
        }
        Value::Array(items) => Value::Array(items.iter().map(prune_schema).collect()),
        other => other.clone(),
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn ensure_ready(&self, overrides: &Overrides, experiment_name: &str) -> Result<(), StrategyError> {
        if !self.api_keys(overrides).is_empty() {
            return Ok(());
        }
        Err(StrategyError::Skip(format!(
            "GEMINI_API_KEY is not configured; skipping experiment '{experiment_name}'"
        )))
    }

    fn default_model(&self, stage: Stage) -> Option<String> {
        Some(
            match stage {
                Stage::Research => "gemini-2.5-flash",
                Stage::Forecast => "gemini-2.5-pro",
            }
            .to_string(),
        )
    }

    fn default_tools(&self, stage: Stage) -> Option<Vec<Value>> {
        match stage {
            Stage::Research => Some(vec![json!({"google_search_retrieval": {}})]),
            Stage::Forecast => None,
        }
    }

    fn json_mode_options(&self, _schema_name: &str, schema: &Value) -> Result<Overrides, ExecutionError> {
        let mut options = Overrides::new();
        options.insert(
            "generation_config".to_string(),
            json!({
                "response_mime_type": "application/json",
                "response_schema": prune_schema(schema),
            }),
        );
        Ok(options)
    }

    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse, LlmCallError> {
        let keys = self.api_keys(&request.overrides);
        if keys.is_empty() {
            return Err(LlmCallError {
                kind: LlmErrorKind::Configuration,
                status: None,
                request_id: None,
                attempts: 0,
                transport: TransportMode::NonStreaming,
                message: "GEMINI_API_KEY is not configured".to_string(),
            });
        }

        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url(&request.overrides),
            request.model
        );
        let payload = build_payload(request);
        let label = format!("Gemini {} ({})", request.experiment_name, request.model);

        call_with_retry(&self.retry, &label, false, |plan| {
            self.attempt(&url, &keys, &payload, plan)
        })
        .await
    }

    fn extract_json(&self, response: &LlmResponse) -> Result<Value, ExecutionError> {
        let text: String = response
            .raw
            .get("candidates")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|c| c.pointer("/content/parts").and_then(Value::as_array))
            .flatten()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        if text.trim().is_empty() {
            return Err(ExecutionError::new("LLM response did not include a JSON payload"));
        }
        serde_json::from_str(text.trim())
            .map_err(|e| ExecutionError::new(format!("Failed to decode JSON payload from LLM response: {e}")))
    }

    fn usage(&self, response: &LlmResponse) -> Option<Value> {
        response.raw.get("usageMetadata").filter(|u| !u.is_null()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::stub_server::serve;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    fn provider(api_key: Option<&str>, extra: &[&str]) -> GeminiProvider {
        let config = GeminiConfig {
            api_key: api_key.map(str::to_string),
            additional_api_keys: extra.iter().map(|k| k.to_string()).collect(),
            ..GeminiConfig::default()
        };
        GeminiProvider::new(config, RetryPolicy::default()).unwrap()
    }

    #[test]
    fn test_api_keys_are_ordered_and_deduplicated() {
        let p = provider(Some("k-config"), &["k-extra", "k-config"]);
        let mut overrides = Overrides::new();
        overrides.insert("api_key".to_string(), json!("k-override"));
        overrides.insert("api_keys".to_string(), json!(["k-list", "k-override", " "]));
        assert_eq!(
            p.api_keys(&overrides),
            vec!["k-override", "k-list", "k-config", "k-extra"]
        );
    }

    #[test]
    fn test_missing_key_skips_experiment() {
        let p = provider(None, &[]);
        assert_eq!(
            p.ensure_ready(&Overrides::new(), "gemini:research:search").unwrap_err(),
            StrategyError::Skip(
                "GEMINI_API_KEY is not configured; skipping experiment 'gemini:research:search'"
                    .to_string()
            )
        );
        assert!(provider(Some("k"), &[]).ensure_ready(&Overrides::new(), "x").is_ok());
    }

    #[test]
    fn test_payload_maps_messages_generation_and_tools() {
        let mut options = Overrides::new();
        options.insert("temperature".to_string(), json!(0.3));
        options.insert("generation_config".to_string(), json!({"candidate_count": 1}));
        let request = LlmRequest {
            model: "gemini-2.5-flash".to_string(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("question")],
            options,
            tools: Some(vec![json!({"type": "google_search"})]),
            overrides: Overrides::new(),
            run_id: "run".to_string(),
            experiment_name: "exp".to_string(),
            strategy_name: "s".to_string(),
            stage: Stage::Research,
        };
        let payload = build_payload(&request);
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(payload["contents"].as_array().unwrap().len(), 1);
        assert_eq!(payload["contents"][0]["role"], "user");
        assert_eq!(payload["generation_config"]["temperature"], 0.3);
        assert_eq!(payload["generation_config"]["candidate_count"], 1);
        assert_eq!(payload["tools"], json!([{"google_search_retrieval": {}}]));
    }

    #[test]
    fn test_schema_pruning() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                "sources": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["confidence"]
        });
        let pruned = prune_schema(&schema);
        assert_eq!(
            pruned,
            json!({
                "type": "OBJECT",
                "properties": {
                    "confidence": {"type": "NUMBER"},
                    "sources": {"type": "ARRAY", "items": {"type": "STRING"}}
                },
                "required": ["confidence"]
            })
        );
    }

    #[test]
    fn test_extract_json_and_usage() {
        let p = provider(Some("k"), &[]);
        let response = LlmResponse {
            provider: "gemini".to_string(),
            raw: json!({
                "candidates": [{"content": {"parts": [{"text": "{\"summary\":"}, {"text": "\"x\"}"}]}}],
                "usageMetadata": {"totalTokenCount": 12}
            }),
            response_id: None,
        };
        assert_eq!(p.extract_json(&response).unwrap(), json!({"summary": "x"}));
        assert_eq!(p.usage(&response), Some(json!({"totalTokenCount": 12})));
    }

    #[test]
    fn test_grounding_rejection_detection() {
        let err = AttemptError::http_status(400, None, "Search Grounding is not supported for this model");
        assert!(is_search_grounding_rejection(&err));
        assert!(!is_search_grounding_rejection(&AttemptError::http_status(400, None, "bad field")));
        assert!(!is_search_grounding_rejection(&AttemptError::http_status(429, None, "google_search")));
    }

    /// Rejects the first two calls with 429 and records the key each call used
    async fn rate_limited_twice(
        State(seen): State<Arc<Mutex<Vec<String>>>>,
        headers: HeaderMap,
    ) -> Response {
        let key = headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let mut seen = seen.lock().unwrap();
        seen.push(key);
        if seen.len() < 3 {
            return (StatusCode::TOO_MANY_REQUESTS, "quota exhausted").into_response();
        }
        Json(json!({
            "responseId": "g-1",
            "candidates": [{"content": {"parts": [{"text": "{\"summary\":\"ok\"}"}]}}]
        }))
        .into_response()
    }

    #[tokio::test]
    async fn test_retries_rotate_through_api_keys() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route("/models/:call", post(rate_limited_twice))
            .with_state(Arc::clone(&seen));
        let config = GeminiConfig {
            api_key: Some("k1".to_string()),
            additional_api_keys: vec!["k2".to_string()],
            base_url: serve(router).await,
            ..GeminiConfig::default()
        };
        let retry = RetryPolicy {
            max_attempts: 3,
            stream_failures_before_fallback: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_ratio: 0.0,
        };
        let p = GeminiProvider::new(config, retry).unwrap();
        let request = LlmRequest {
            model: "gemini-2.5-flash".to_string(),
            messages: vec![ChatMessage::user("question")],
            options: Overrides::new(),
            tools: None,
            overrides: Overrides::new(),
            run_id: "run".to_string(),
            experiment_name: "gemini:research:search".to_string(),
            strategy_name: "search".to_string(),
            stage: Stage::Research,
        };

        let response = p.invoke(&request).await.unwrap();

        assert_eq!(response.response_id.as_deref(), Some("g-1"));
        assert_eq!(*seen.lock().unwrap(), vec!["k1", "k2", "k1"]);
        assert_eq!(p.extract_json(&response).unwrap(), json!({"summary": "ok"}));
    }
}
