//! JSON-mode LLM research described by a static profile.
//!
//! Every structured research kind shares one request lifecycle: resolve the
//! provider and model, ask for a schema-constrained JSON artifact, stamp
//! `generated_at`, and attach usage diagnostics. A profile supplies the prompts,
//! the schema, and the optional payload and diagnostics hooks.

use crate::config::Overrides;
use crate::domain::EventMarketGroup;
use crate::error::ExecutionError;
use crate::experiments::builtin::prompts::{format_group, iso_timestamp};
use crate::experiments::fingerprint::hash_payload;
use crate::experiments::strategy::{
    ResearchOutput, ResearchStrategy, StrategyContext, StrategyError, StrategyInfo,
    StrategyOutcome,
};
use crate::llm::{resolve_llm_request, ChatMessage, LlmDefaults, LlmResponse};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, error};

/// Tools sent with a structured research request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResearchTools {
    /// Generic `web_search` tool, translated by each provider
    WebSearch,
    /// Whatever the provider uses by default for research
    ProviderDefault,
    /// Explicit empty tool list
    Disabled,
}

#[derive(Debug, Clone, Copy)]
pub struct ResearchProfile {
    pub kind: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub shared_identity: Option<&'static str>,
    pub system_prompt: &'static str,
    /// Task statement placed above the rendered group context
    pub instructions: &'static str,
    pub schema: fn() -> (&'static str, Value),
    pub default_provider: Option<&'static str>,
    pub default_model: Option<&'static str>,
    pub tools: ResearchTools,
    /// Runs after `generated_at` is stamped
    pub postprocess: Option<fn(&mut Map<String, Value>)>,
    pub extra_diagnostics: Option<fn(&LlmResponse) -> Overrides>,
}

impl ResearchProfile {
    pub fn user_prompt(&self, group: &EventMarketGroup) -> String {
        format!("{}\n\nContext:\n{}", self.instructions, format_group(group))
    }

    fn defaults(&self, ctx: &StrategyContext<'_>) -> LlmDefaults {
        let default_tools = match self.tools {
            ResearchTools::WebSearch => Some(vec![json!({"type": "web_search"})]),
            ResearchTools::ProviderDefault => None,
            ResearchTools::Disabled => Some(Vec::new()),
        };
        // the configured research model belongs to the default provider
        let fallback_model = match self.default_provider {
            None => ctx.run.llm.config.openai.research_model.clone(),
            Some(_) => None,
        };
        LlmDefaults {
            default_provider: self.default_provider.map(str::to_string),
            default_model: self.default_model.map(str::to_string),
            fallback_model,
            default_tools,
            ..LlmDefaults::new()
        }
    }
}

/// Research strategy backed by a [`ResearchProfile`]
#[derive(Debug, Clone, Copy)]
pub struct StructuredResearch {
    profile: &'static ResearchProfile,
}

impl StructuredResearch {
    pub fn new(profile: &'static ResearchProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &'static ResearchProfile {
        self.profile
    }

    async fn research(
        &self,
        group: &EventMarketGroup,
        ctx: &StrategyContext<'_>,
    ) -> Result<ResearchOutput, StrategyError> {
        let profile = self.profile;
        let runtime = resolve_llm_request(ctx, &profile.defaults(ctx))?;
        debug!(
            "Running {} via {} ({}) for event {}",
            ctx.experiment_name,
            runtime.provider_name,
            runtime.model,
            group.event_label()
        );

        let (schema_name, schema) = (profile.schema)();
        let options = runtime.merge_options(runtime.json_mode_options(schema_name, &schema)?);
        let messages = vec![
            ChatMessage::system(profile.system_prompt),
            ChatMessage::user(profile.user_prompt(group)),
        ];

        let response = runtime.invoke(messages, options).await.map_err(|err| {
            error!("LLM research request failed for {}: {}", ctx.experiment_name, err);
            err
        })?;

        let mut payload = runtime.extract_json(&response)?;
        let Some(map) = payload.as_object_mut() else {
            return Err(ExecutionError::new("LLM research payload is not a JSON object").into());
        };
        map.entry("generated_at")
            .or_insert_with(|| Value::String(iso_timestamp()));
        if let Some(postprocess) = profile.postprocess {
            postprocess(map);
        }

        let mut extra = Overrides::new();
        if let Some(id) = &response.response_id {
            extra.insert("response_id".to_string(), json!(id));
        }
        if let Some(diagnostics) = profile.extra_diagnostics {
            extra.extend(diagnostics(&response));
        }
        let diagnostics = runtime.diagnostics(runtime.usage(&response), extra);

        Ok(ResearchOutput {
            artifact_hash: hash_payload(&payload),
            payload,
            artifact_uri: None,
            diagnostics: Some(diagnostics),
        })
    }
}

#[async_trait]
impl ResearchStrategy for StructuredResearch {
    fn info(&self) -> StrategyInfo {
        StrategyInfo {
            name: self.profile.kind.to_string(),
            version: self.profile.version.to_string(),
            description: Some(self.profile.description.to_string()),
            shared_identity: self.profile.shared_identity.map(str::to_string),
        }
    }

    async fn run(
        &self,
        group: &EventMarketGroup,
        ctx: &StrategyContext<'_>,
    ) -> StrategyOutcome<ResearchOutput> {
        self.research(group, ctx).await.into()
    }
}
