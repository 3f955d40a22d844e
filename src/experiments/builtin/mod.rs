//! Built-in strategy catalogue.
//!
//! Strategies are looked up by kind when suites are assembled, either from the
//! default suites or from a TOML catalogue.

pub mod evidence;
pub mod llm_forecast;
pub mod market_implied;
pub mod market_snapshot;
pub mod prompts;
pub mod structured;
pub mod superforecaster;
pub mod web_search;

pub use evidence::{ATLAS_RESEARCH_SWEEP, HORIZON_SIGNAL_TIMELINE};
pub use llm_forecast::{LlmForecast, GEMINI_FORECAST, LLM_FORECAST};
pub use market_implied::{MarketImplied, MARKET_IMPLIED};
pub use market_snapshot::{MarketSnapshot, MARKET_SNAPSHOT};
pub use structured::{ResearchProfile, StructuredResearch};
pub use superforecaster::{SuperforecasterDelphi, SUPERFORECASTER_BRIEFING, SUPERFORECASTER_DELPHI};
pub use web_search::{GEMINI_WEB_SEARCH, LLM_WEB_SEARCH};

use crate::experiments::strategy::Stage;
use crate::experiments::suite::{ForecastFactory, ResearchFactory};

/// Catalogue entry shown by `available_kinds`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyKind {
    pub stage: Stage,
    pub kind: &'static str,
    pub description: &'static str,
}

pub fn available_kinds() -> Vec<StrategyKind> {
    vec![
        StrategyKind {
            stage: Stage::Research,
            kind: MARKET_SNAPSHOT,
            description: "Normalized market and contract snapshot, no LLM call",
        },
        StrategyKind {
            stage: Stage::Research,
            kind: LLM_WEB_SEARCH,
            description: "Structured brief grounded in web search results",
        },
        StrategyKind {
            stage: Stage::Research,
            kind: GEMINI_WEB_SEARCH,
            description: "Structured brief grounded with Gemini Google Search",
        },
        StrategyKind {
            stage: Stage::Research,
            kind: ATLAS_RESEARCH_SWEEP,
            description: "Bullish and bearish evidence with key risks",
        },
        StrategyKind {
            stage: Stage::Research,
            kind: HORIZON_SIGNAL_TIMELINE,
            description: "Past and upcoming catalysts with impact notes",
        },
        StrategyKind {
            stage: Stage::Research,
            kind: SUPERFORECASTER_BRIEFING,
            description: "Reference class, base rate, scenarios and update triggers",
        },
        StrategyKind {
            stage: Stage::Forecast,
            kind: MARKET_IMPLIED,
            description: "Contract prices as probabilities, no research needed",
        },
        StrategyKind {
            stage: Stage::Forecast,
            kind: LLM_FORECAST,
            description: "JSON-mode LLM forecast over research artifacts",
        },
        StrategyKind {
            stage: Stage::Forecast,
            kind: GEMINI_FORECAST,
            description: "JSON-mode forecast served by Gemini",
        },
        StrategyKind {
            stage: Stage::Forecast,
            kind: SUPERFORECASTER_DELPHI,
            description: "Briefing-anchored forecast regressed toward contract prices",
        },
    ]
}

fn profile(kind: &str) -> Option<&'static ResearchProfile> {
    [
        &web_search::WEB_SEARCH,
        &web_search::GEMINI_WEB_SEARCH_PROFILE,
        &evidence::ATLAS,
        &evidence::HORIZON,
        &superforecaster::BRIEFING,
    ]
    .into_iter()
    .find(|profile| profile.kind == kind)
}

pub fn research_factory(kind: &str) -> Option<ResearchFactory> {
    match kind {
        MARKET_SNAPSHOT => Some(ResearchFactory::research(MarketSnapshot::new)),
        _ => profile(kind).map(|profile| ResearchFactory::research(move || StructuredResearch::new(profile))),
    }
}

/// Forecasts that read every research artifact of their suite when no list is given
pub fn reads_all_research(kind: &str) -> bool {
    matches!(kind, LLM_FORECAST | GEMINI_FORECAST)
}

/// Forecast factory for `kind` with its research dependencies
pub fn forecast_factory(kind: &str, requires: Vec<String>) -> Option<ForecastFactory> {
    match kind {
        MARKET_IMPLIED => Some(ForecastFactory::forecast(MarketImplied::new).requires(requires)),
        LLM_FORECAST => {
            let deps = requires.clone();
            Some(ForecastFactory::forecast(move || LlmForecast::new(deps.clone())).requires(requires))
        }
        GEMINI_FORECAST => {
            let deps = requires.clone();
            Some(ForecastFactory::forecast(move || LlmForecast::gemini(deps.clone())).requires(requires))
        }
        // other research of the suite reaches the forecast without being a hard dependency
        SUPERFORECASTER_DELPHI if requires.is_empty() => Some(ForecastFactory::forecast(SuperforecasterDelphi::new)),
        SUPERFORECASTER_DELPHI => Some(ForecastFactory::forecast(SuperforecasterDelphi::new).requires(requires)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiments::suite::ExperimentSuite;

    #[test]
    fn test_every_listed_kind_resolves() {
        for entry in available_kinds() {
            let found = match entry.stage {
                Stage::Research => research_factory(entry.kind).is_some(),
                Stage::Forecast => forecast_factory(entry.kind, vec![]).is_some(),
            };
            assert!(found, "kind {} missing", entry.kind);
        }
        assert!(research_factory("unknown").is_none());
        assert!(forecast_factory(LLM_WEB_SEARCH, vec![]).is_none());
    }

    #[test]
    fn test_delphi_requires_only_the_briefing_by_default() {
        let suite = ExperimentSuite::builder("s")
            .research(research_factory(SUPERFORECASTER_BRIEFING).unwrap())
            .research(research_factory(LLM_WEB_SEARCH).unwrap())
            .forecast(forecast_factory(SUPERFORECASTER_DELPHI, Vec::new()).unwrap())
            .build()
            .unwrap();
        assert_eq!(suite.forecasts()[0].requires, vec![SUPERFORECASTER_BRIEFING.to_string()]);
    }

    #[test]
    fn test_profiled_research_reports_its_kind() {
        for kind in [
            LLM_WEB_SEARCH,
            GEMINI_WEB_SEARCH,
            ATLAS_RESEARCH_SWEEP,
            HORIZON_SIGNAL_TIMELINE,
            SUPERFORECASTER_BRIEFING,
        ] {
            let suite = ExperimentSuite::builder("s")
                .research(research_factory(kind).unwrap())
                .build()
                .unwrap();
            assert_eq!(suite.research()[0].identity.name, kind);
        }
    }
}
