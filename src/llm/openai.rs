//! OpenAI Responses API provider.
//!
//! Calls stream server-sent events by default and record the response id as soon as
//! it is announced. After a configured number of streaming failures the remaining
//! attempts use plain requests. A stream that times out after the id was observed is
//! recovered by retrieving the stored response.

use crate::config::{OpenAiConfig, Overrides};
use crate::error::{ExecutionError, LlmCallError, LlmErrorKind, PipelineError, TransportMode};
use crate::experiments::strategy::{Stage, StrategyError};
use crate::llm::provider::{LlmProvider, LlmRequest, LlmResponse};
use crate::llm::retry::{call_with_retry, AttemptError, AttemptPlan, RetryPolicy};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_ERROR_BODY: usize = 500;

pub struct OpenAiProvider {
    config: OpenAiConfig,
    retry: RetryPolicy,
    client: Client,
}

/// Per-call connection settings after applying overrides
struct CallTarget {
    base_url: String,
    api_key: String,
    organization: Option<String>,
    project: Option<String>,
}

/// Accumulated state of one streamed response
#[derive(Debug, Default)]
struct StreamState {
    response_id: Option<String>,
    completed: Option<Value>,
    output_text: String,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig, retry: RetryPolicy) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            retry,
            client,
        })
    }

    fn override_str<'a>(overrides: &'a Overrides, key: &str) -> Option<&'a str> {
        overrides
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn api_key(&self, overrides: &Overrides) -> Option<String> {
        Self::override_str(overrides, "api_key")
            .map(str::to_string)
            .or_else(|| self.config.api_key.clone())
            .filter(|k| !k.trim().is_empty())
    }

    fn target(&self, overrides: &Overrides) -> Option<CallTarget> {
        let api_key = self.api_key(overrides)?;
        let base_url = Self::override_str(overrides, "api_base")
            .unwrap_or(self.config.base_url.as_str())
            .trim_end_matches('/')
            .to_string();
        Some(CallTarget {
            base_url,
            api_key,
            organization: Self::override_str(overrides, "organization")
                .map(str::to_string)
                .or_else(|| self.config.organization.clone()),
            project: Self::override_str(overrides, "project")
                .map(str::to_string)
                .or_else(|| self.config.project.clone()),
        })
    }

    fn authorized(&self, builder: RequestBuilder, target: &CallTarget) -> RequestBuilder {
        let mut builder = builder.bearer_auth(&target.api_key);
        if let Some(org) = &target.organization {
            builder = builder.header("OpenAI-Organization", org);
        }
        if let Some(project) = &target.project {
            builder = builder.header("OpenAI-Project", project);
        }
        builder
    }

    async fn attempt(
        &self,
        target: &CallTarget,
        payload: &Value,
        plan: AttemptPlan,
    ) -> Result<LlmResponse, AttemptError> {
        match plan.transport {
            TransportMode::Streaming => self.stream_once(target, payload).await,
            TransportMode::NonStreaming => self.create_once(target, payload).await,
        }
    }

    async fn create_once(&self, target: &CallTarget, payload: &Value) -> Result<LlmResponse, AttemptError> {
        let url = format!("{}/responses", target.base_url);
        let response = self
            .authorized(self.client.post(&url), target)
            .json(payload)
            .send()
            .await
            .map_err(|e| AttemptError::from_reqwest(&e))?;
        let response = check_status(response).await?;
        let request_id = request_id(&response);
        let raw: Value = response
            .json()
            .await
            .map_err(|e| AttemptError::from_reqwest(&e).with_request_id(request_id.clone()))?;
        Ok(self.response_from(raw))
    }

    async fn stream_once(&self, target: &CallTarget, payload: &Value) -> Result<LlmResponse, AttemptError> {
        let url = format!("{}/responses", target.base_url);
        let mut body = payload.clone();
        if let Some(map) = body.as_object_mut() {
            map.insert("stream".to_string(), Value::Bool(true));
        }

        let response = self
            .authorized(self.client.post(&url), target)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| AttemptError::from_reqwest(&e))?;
        let response = check_status(response).await?;
        let request_id = request_id(&response);

        let mut state = StreamState::default();
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunks = response.bytes_stream();

        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let failure = AttemptError::from_reqwest(&err).with_request_id(request_id.clone());
                    if failure.kind == LlmErrorKind::Timeout {
                        if let Some(id) = state.response_id.clone() {
                            if let Some(recovered) = self.recover(target, &id).await {
                                return Ok(recovered);
                            }
                        }
                    }
                    return Err(failure);
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some((end, sep_len)) = find_event_boundary(&buffer) {
                let block: Vec<u8> = buffer.drain(..end + sep_len).collect();
                let text = String::from_utf8_lossy(&block[..end]);
                if let Some(event) = parse_sse_block(&text)
                    .map_err(|e| e.with_request_id(request_id.clone()))?
                {
                    apply_stream_event(&mut state, &event)
                        .map_err(|e| e.with_request_id(request_id.clone()))?;
                }
            }

            if state.completed.is_some() {
                break;
            }
        }

        if state.completed.is_none() && !buffer.is_empty() {
            let text = String::from_utf8_lossy(&buffer).to_string();
            if let Some(event) = parse_sse_block(&text)? {
                apply_stream_event(&mut state, &event)?;
            }
        }

        match state.completed.take() {
            Some(mut raw) => {
                if raw.get("output_text").is_none() && !state.output_text.is_empty() {
                    if let Some(map) = raw.as_object_mut() {
                        map.insert("output_text".to_string(), Value::String(state.output_text));
                    }
                }
                Ok(self.response_from(raw))
            }
            None => Err(AttemptError::malformed_stream(format!(
                "stream ended before response.completed (response_id={})",
                state.response_id.as_deref().unwrap_or("none")
            ))
            .with_request_id(request_id)),
        }
    }

    /// Fetch a stored response after a stream timeout
    async fn recover(&self, target: &CallTarget, response_id: &str) -> Option<LlmResponse> {
        warn!(
            "OpenAI stream timed out; retrieving cached response response_id={}",
            response_id
        );
        let url = format!("{}/responses/{}", target.base_url, response_id);
        let result = async {
            let response = self
                .authorized(self.client.get(&url), target)
                .send()
                .await
                .map_err(|e| AttemptError::from_reqwest(&e))?;
            let response = check_status(response).await?;
            response
                .json::<Value>()
                .await
                .map_err(|e| AttemptError::from_reqwest(&e))
        }
        .await;

        match result {
            Ok(raw) => {
                let status = raw.get("status").and_then(Value::as_str).unwrap_or("completed");
                if status == "completed" {
                    Some(self.response_from(raw))
                } else {
                    warn!(
                        "Recovered response {} is not complete yet (status={})",
                        response_id, status
                    );
                    None
                }
            }
            Err(err) => {
                warn!(
                    "Failed to recover OpenAI response after timeout response_id={}: {}",
                    response_id, err.message
                );
                None
            }
        }
    }

    fn response_from(&self, raw: Value) -> LlmResponse {
        let response_id = raw.get("id").and_then(Value::as_str).map(str::to_string);
        LlmResponse {
            provider: self.name().to_string(),
            raw,
            response_id,
        }
    }
}

/// Request body for the Responses API
pub fn build_payload(request: &LlmRequest) -> Value {
    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(request.model));
    payload.insert("input".to_string(), json!(request.messages));
    for (key, value) in &request.options {
        payload.insert(key.clone(), value.clone());
    }
    if let Some(tools) = &request.tools {
        payload.insert("tools".to_string(), Value::Array(tools.clone()));
    }

    let mut metadata = payload
        .get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let defaults = [
        ("pipeline_run_id", request.run_id.as_str()),
        ("experiment", request.experiment_name.as_str()),
        ("strategy", request.strategy_name.as_str()),
        ("stage", request.stage.as_str()),
    ];
    for (key, value) in defaults {
        if !value.is_empty() {
            metadata
                .entry(key.to_string())
                .or_insert_with(|| Value::String(value.to_string()));
        }
    }
    metadata.retain(|_, v| !v.is_null() && v.as_str() != Some(""));
    payload.insert("metadata".to_string(), Value::Object(metadata));

    Value::Object(payload)
}

fn request_id(response: &Response) -> Option<String> {
    response
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn check_status(response: Response) -> Result<Response, AttemptError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let request_id = request_id(&response);
    let body = response.text().await.unwrap_or_default();
    let message: String = body.chars().take(MAX_ERROR_BODY).collect();
    warn!(
        "OpenAI returned status {} (request_id={})",
        status,
        request_id.as_deref().unwrap_or("none")
    );
    Err(AttemptError::http_status(status.as_u16(), request_id, message))
}

/// Position and length of the first blank-line separator
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Parse one SSE block; `None` for comments, keep-alives, and `[DONE]`
fn parse_sse_block(block: &str) -> Result<Option<Value>, AttemptError> {
    let data: Vec<&str> = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|line| line.strip_prefix(' ').unwrap_or(line))
        .collect();
    if data.is_empty() {
        return Ok(None);
    }
    let joined = data.join("\n");
    let trimmed = joined.trim();
    if trimmed.is_empty() || trimmed == "[DONE]" {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| AttemptError::malformed_stream(format!("invalid stream event: {e}")))
}

fn apply_stream_event(state: &mut StreamState, event: &Value) -> Result<(), AttemptError> {
    if let Some(id) = event
        .get("response")
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
    {
        if state.response_id.is_none() {
            debug!("OpenAI stream announced response_id={}", id);
        }
        state.response_id = Some(id.to_string());
    }

    match event.get("type").and_then(Value::as_str).unwrap_or_default() {
        "response.output_text.delta" => {
            if let Some(delta) = event.get("delta").and_then(Value::as_str) {
                state.output_text.push_str(delta);
            }
        }
        "response.completed" => {
            state.completed = Some(event.get("response").cloned().unwrap_or(Value::Null));
        }
        "response.failed" | "response.incomplete" => {
            let detail = event
                .pointer("/response/error/message")
                .or_else(|| event.pointer("/response/incomplete_details/reason"))
                .and_then(Value::as_str)
                .unwrap_or("no detail");
            return Err(AttemptError::invalid_response(format!(
                "response ended with {}: {detail}",
                event["type"].as_str().unwrap_or_default()
            )));
        }
        "error" => {
            let message = event
                .get("message")
                .or_else(|| event.pointer("/error/message"))
                .and_then(Value::as_str)
                .unwrap_or("stream error");
            return Err(AttemptError::malformed_stream(message.to_string()));
        }
        _ => {}
    }
    Ok(())
}

/// Object schemas must list every declared property in `required`
pub fn validate_required_fields(schema_name: &str, schema: &Value, path: &str) -> Result<(), ExecutionError> {
    if has_type(schema, "object") {
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            let required: Vec<&str> = schema
                .get("required")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let mut missing: Vec<&str> = properties
                .keys()
                .map(String::as_str)
                .filter(|key| !required.contains(key))
                .collect();
            if !missing.is_empty() {
                missing.sort_unstable();
                let location = if path.is_empty() { "<root>" } else { path };
                return Err(ExecutionError::new(format!(
                    "OpenAI JSON schema '{schema_name}' must mark properties {} as required at {location}",
                    missing.join(", ")
                )));
            }
            for (key, sub) in properties {
                if sub.is_object() {
                    let next = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    validate_required_fields(schema_name, sub, &next)?;
                }
            }
        }
    }
    if has_type(schema, "array") {
        if let Some(items) = schema.get("items").filter(|i| i.is_object()) {
            let next = if path.is_empty() {
                "[]".to_string()
            } else {
                format!("{path}[]")
            };
            validate_required_fields(schema_name, items, &next)?;
        }
    }
    Ok(())
}

fn has_type(schema: &Value, expected: &str) -> bool {
    match schema.get("type") {
        Some(Value::String(t)) => t == expected,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(expected)),
        _ => false,
    }
}

/// First non-empty text of a Responses API result
pub fn response_text(raw: &Value) -> Option<&str> {
    if let Some(text) = raw
        .get("output_text")
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
    {
        return Some(text);
    }
    raw.get("output")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter_map(|content| {
            content
                .get("text")
                .or_else(|| content.get("output_text"))
                .and_then(Value::as_str)
        })
        .find(|text| !text.trim().is_empty())
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn ensure_ready(&self, overrides: &Overrides, experiment_name: &str) -> Result<(), StrategyError> {
        let bypass = ["skip_api_key_check", "skip_openai_api_key_check"]
            .iter()
            .any(|key| overrides.get(*key).and_then(Value::as_bool).unwrap_or(false));
        if bypass || self.api_key(overrides).is_some() {
            return Ok(());
        }
        Err(StrategyError::Skip(format!(
            "OPENAI_API_KEY is not configured; skipping experiment '{experiment_name}'"
        )))
    }

    fn default_model(&self, stage: Stage) -> Option<String> {
        Some(
            match stage {
                Stage::Research => "gpt-4.1-mini",
                Stage::Forecast => "gpt-5",
            }
            .to_string(),
        )
    }

    fn default_tools(&self, stage: Stage) -> Option<Vec<Value>> {
        match stage {
            Stage::Research => Some(vec![json!({"type": "web_search"})]),
            Stage::Forecast => None,
        }
    }

    fn json_mode_options(&self, schema_name: &str, schema: &Value) -> Result<Overrides, ExecutionError> {
        validate_required_fields(schema_name, schema, "")?;
        let mut options = Overrides::new();
        options.insert(
            "text".to_string(),
            json!({
                "format": {
                    "type": "json_schema",
                    "name": schema_name,
                    "schema": schema,
                }
            }),
        );
        Ok(options)
    }

    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse, LlmCallError> {
        let target = self.target(&request.overrides).ok_or_else(|| LlmCallError {
            kind: LlmErrorKind::Configuration,
            status: None,
            request_id: None,
            attempts: 0,
            transport: TransportMode::NonStreaming,
            message: "OPENAI_API_KEY is not configured".to_string(),
        })?;
        let payload = build_payload(request);
        let label = format!("OpenAI {} ({})", request.experiment_name, request.model);

        call_with_retry(&self.retry, &label, true, |plan| {
            self.attempt(&target, &payload, plan)
        })
        .await
    }

    fn extract_json(&self, response: &LlmResponse) -> Result<Value, ExecutionError> {
        let text = response_text(&response.raw)
            .ok_or_else(|| ExecutionError::new("LLM response did not include a JSON payload"))?;
        serde_json::from_str(text)
            .map_err(|e| ExecutionError::new(format!("Failed to decode JSON payload from LLM response: {e}")))
    }

    fn usage(&self, response: &LlmResponse) -> Option<Value> {
        response.raw.get("usage").filter(|u| !u.is_null()).cloned()
    }
}
