//! Evidence sweep and catalyst timeline research.

use crate::experiments::builtin::structured::{ResearchProfile, ResearchTools};
use serde_json::{json, Value};

pub const ATLAS_RESEARCH_SWEEP: &str = "atlas_research_sweep";
pub const HORIZON_SIGNAL_TIMELINE: &str = "horizon_signal_timeline";

const ANALYST_PROMPT: &str = "You are an analyst producing structured intelligence summaries for prediction markets. \
Use the provided context plus web search results to build a concise brief.";

/// Strongest points for and against the primary outcome
pub static ATLAS: ResearchProfile = ResearchProfile {
    kind: ATLAS_RESEARCH_SWEEP,
    version: "0.1",
    description: "Structured sweep of supporting and challenging evidence",
    shared_identity: None,
    system_prompt: "You are compiling a balanced research brief. Surface the strongest points for and against \
the event resolving in favour of the primary market outcome.",
    instructions: "Identify the most compelling bullish and bearish evidence for this market. \
Limit each side to three concise points with citations.",
    schema: sweep_schema,
    default_provider: None,
    default_model: None,
    tools: ResearchTools::WebSearch,
    postprocess: None,
    extra_diagnostics: None,
};

/// Past and upcoming catalysts with their expected impact
pub static HORIZON: ResearchProfile = ResearchProfile {
    kind: HORIZON_SIGNAL_TIMELINE,
    version: "0.1",
    description: "Categorised timeline of catalysts with impact annotations",
    shared_identity: None,
    system_prompt: ANALYST_PROMPT,
    instructions: "List notable catalysts that have already happened and those expected soon. \
Explain how each item might move the market.",
    schema: timeline_schema,
    default_provider: None,
    default_model: None,
    tools: ResearchTools::Disabled,
    postprocess: None,
    extra_diagnostics: None,
};

fn string_list(description: &str) -> Value {
    json!({"type": "array", "items": {"type": "string"}, "description": description})
}

pub fn sweep_schema() -> (&'static str, Value) {
    let schema = json!({
        "type": "object",
        "properties": {
            "bullish": string_list("Arguments suggesting the main outcome resolves positive"),
            "bearish": string_list("Arguments suggesting the main outcome fails"),
            "key_risks": string_list("Cross-cutting risks or unknowns"),
            "generated_at": {"type": "string"}
        },
        "required": ["bullish", "bearish", "key_risks", "generated_at"],
        "additionalProperties": false
    });
    ("EvidenceSweep", schema)
}

/// `date` and `notes` are nullable so strict structured output accepts them as required
pub fn timeline_schema() -> (&'static str, Value) {
    let entry = json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "date": {"type": ["string", "null"]},
            "impact": {"type": "string"},
            "notes": {"type": ["string", "null"]}
        },
        "required": ["title", "date", "impact", "notes"],
        "additionalProperties": false
    });
    let schema = json!({
        "type": "object",
        "properties": {
            "past": {"type": "array", "items": entry.clone()},
            "upcoming": {"type": "array", "items": entry},
            "generated_at": {"type": "string"}
        },
        "required": ["past", "upcoming", "generated_at"],
        "additionalProperties": false
    });
    ("CatalystTimeline", schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::openai::validate_required_fields;

    #[test]
    fn test_schemas_satisfy_structured_output_rules() {
        for (name, schema) in [sweep_schema(), timeline_schema()] {
            assert!(validate_required_fields(name, &schema, "").is_ok(), "{name}");
        }
    }

    #[test]
    fn test_timeline_entries_share_one_shape() {
        let (_, schema) = timeline_schema();
        assert_eq!(
            schema["properties"]["past"]["items"],
            schema["properties"]["upcoming"]["items"]
        );
        assert_eq!(HORIZON.tools, ResearchTools::Disabled);
        assert_eq!(ATLAS.tools, ResearchTools::WebSearch);
    }
}
