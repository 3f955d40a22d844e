//! Web-search grounded research briefs.

use crate::config::Overrides;
use crate::experiments::builtin::structured::{ResearchProfile, ResearchTools};
use crate::llm::LlmResponse;
use serde_json::{json, Value};

pub const LLM_WEB_SEARCH: &str = "llm_web_search";
pub const GEMINI_WEB_SEARCH: &str = "gemini_web_search";

const SYSTEM_PROMPT: &str = "You are an analyst producing structured intelligence summaries for prediction markets. \
Use the provided context plus web search results to build a concise brief.";

const INSTRUCTIONS: &str = "Summarise the current state of the following market group. Highlight catalysts, \
key uncertainties, and cite high-quality sources.";

/// Research brief grounded in web search results
pub static WEB_SEARCH: ResearchProfile = ResearchProfile {
    kind: LLM_WEB_SEARCH,
    version: "0.2",
    description: "High-signal synthesis grounded in recent web results",
    shared_identity: Some("catalog:llm_web_search:v0.2"),
    system_prompt: SYSTEM_PROMPT,
    instructions: INSTRUCTIONS,
    schema: brief_schema,
    default_provider: None,
    default_model: None,
    tools: ResearchTools::WebSearch,
    postprocess: None,
    extra_diagnostics: None,
};

/// Same brief through Gemini with Google Search grounding
pub static GEMINI_WEB_SEARCH_PROFILE: ResearchProfile = ResearchProfile {
    kind: GEMINI_WEB_SEARCH,
    version: "0.1",
    description: "Google Search grounded synthesis using Gemini",
    shared_identity: Some("catalog:gemini_web_search:v0.1"),
    system_prompt: "You are an analyst producing structured intelligence summaries for prediction markets. \
Use the provided context plus grounded Google Search results to craft a concise brief.",
    instructions: INSTRUCTIONS,
    schema: gemini_brief_schema,
    default_provider: Some("gemini"),
    default_model: Some("gemini-2.5-flash"),
    tools: ResearchTools::ProviderDefault,
    postprocess: None,
    extra_diagnostics: Some(grounding_metadata),
};

pub fn brief_schema() -> (&'static str, Value) {
    ("ResearchArtifact", brief_body())
}

fn gemini_brief_schema() -> (&'static str, Value) {
    ("GeminiResearchArtifact", brief_body())
}

fn brief_body() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string", "description": "Three-sentence synthesis"},
            "key_insights": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Bullet list of the most important takeaways"
            },
            "confidence": {"type": "string", "description": "Low/Medium/High confidence assessment"},
            "sources": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "url": {"type": "string"},
                        "snippet": {"type": "string"}
                    },
                    "required": ["title", "url", "snippet"],
                    "additionalProperties": false
                }
            },
            "generated_at": {"type": "string"}
        },
        "required": ["summary", "key_insights", "confidence", "sources", "generated_at"],
        "additionalProperties": false
    })
}

/// Grounding metadata of the first candidate that carries it
fn grounding_metadata(response: &LlmResponse) -> Overrides {
    let mut extra = Overrides::new();
    let metadata = response
        .raw
        .get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find_map(|candidate| {
            candidate
                .get("grounding_metadata")
                .or_else(|| candidate.get("groundingMetadata"))
                .filter(|m| !m.is_null())
        });
    if let Some(metadata) = metadata {
        extra.insert("grounding_metadata".to_string(), metadata.clone());
    }
    extra
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiments::builtin::structured::StructuredResearch;
    use crate::experiments::strategy::ResearchStrategy;
    use crate::llm::openai::validate_required_fields;

    #[test]
    fn test_schema_satisfies_structured_output_rules() {
        for (name, schema) in [brief_schema(), gemini_brief_schema()] {
            assert!(validate_required_fields(name, &schema, "").is_ok());
        }
    }

    #[test]
    fn test_identity_is_shareable() {
        let info = StructuredResearch::new(&WEB_SEARCH).info();
        assert_eq!(info.name, LLM_WEB_SEARCH);
        assert_eq!(info.shared_identity.as_deref(), Some("catalog:llm_web_search:v0.2"));

        let gemini = StructuredResearch::new(&GEMINI_WEB_SEARCH_PROFILE).info();
        assert_eq!(gemini.name, GEMINI_WEB_SEARCH);
        assert_eq!(gemini.version, "0.1");
    }

    #[test]
    fn test_grounding_metadata_taken_from_first_grounded_candidate() {
        let response = LlmResponse {
            provider: "gemini".to_string(),
            raw: json!({
                "candidates": [
                    {"content": {}},
                    {"groundingMetadata": {"webSearchQueries": ["rain"]}},
                    {"grounding_metadata": {"webSearchQueries": ["snow"]}}
                ]
            }),
            response_id: None,
        };
        let extra = grounding_metadata(&response);
        assert_eq!(
            extra["grounding_metadata"],
            json!({"webSearchQueries": ["rain"]})
        );

        let bare = LlmResponse {
            provider: "gemini".to_string(),
            raw: json!({"candidates": []}),
            response_id: None,
        };
        assert!(grounding_metadata(&bare).is_empty());
    }
}
