//! Research bundle planning.
//!
//! Suites that declare the same shared identity, version, and override fingerprint for
//! a research strategy collapse onto one bundle and execute once per group. Everything
//! else gets a suite-scoped bundle that can never collide across suites.

use crate::experiments::fingerprint::fingerprint_overrides;
use crate::experiments::overrides::ExperimentOverrides;
use crate::experiments::strategy::{ResearchStrategy, Stage};
use crate::experiments::suite::ExperimentSuite;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Grouping key; `Shared` keys order before `Suite` keys
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BundleKey {
    Shared {
        identity: String,
        version: String,
        fingerprint: String,
    },
    Suite {
        suite_id: String,
        strategy_name: String,
    },
}

impl BundleKey {
    pub fn is_shared(&self) -> bool {
        matches!(self, BundleKey::Shared { .. })
    }
}

/// One suite's participation in a bundle
#[derive(Clone)]
pub struct ResearchBundleMember {
    pub suite_id: String,
    pub strategy_name: String,
    pub strategy_version: String,
    pub strategy: Arc<dyn ResearchStrategy>,
    pub experiment_name: String,
    pub config_fingerprint: String,
}

impl std::fmt::Debug for ResearchBundleMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResearchBundleMember")
            .field("suite_id", &self.suite_id)
            .field("strategy_name", &self.strategy_name)
            .field("experiment_name", &self.experiment_name)
            .field("config_fingerprint", &self.config_fingerprint)
            .finish()
    }
}

/// Unit of deduplicated research execution
#[derive(Debug, Clone)]
pub struct ResearchBundle {
    pub key: BundleKey,
    /// Shared identity, or `suite_id:strategy_name` for suite-scoped bundles
    pub identity: String,
    pub members: Vec<ResearchBundleMember>,
    /// True only when at least two members collapsed onto one shared key
    pub shared: bool,
}

impl ResearchBundle {
    pub fn suite_ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.suite_id.as_str()).collect()
    }
}

/// Plan research bundles for a run, sorted by key
pub fn plan_research_bundles(
    suites: &[ExperimentSuite],
    overrides: &ExperimentOverrides,
) -> Vec<ResearchBundle> {
    let mut grouped: BTreeMap<BundleKey, Vec<ResearchBundleMember>> = BTreeMap::new();

    for suite in suites {
        for slot in suite.research() {
            let experiment_name = suite.experiment_name(Stage::Research, &slot.identity.name);
            let fingerprint = fingerprint_overrides(&overrides.get(&experiment_name));
            let key = match &slot.identity.shared_identity {
                Some(identity) => BundleKey::Shared {
                    identity: identity.clone(),
                    version: slot.identity.version.clone(),
                    fingerprint: fingerprint.clone(),
                },
                None => BundleKey::Suite {
                    suite_id: suite.suite_id().to_string(),
                    strategy_name: slot.identity.name.clone(),
                },
            };
            grouped.entry(key).or_default().push(ResearchBundleMember {
                suite_id: suite.suite_id().to_string(),
                strategy_name: slot.identity.name.clone(),
                strategy_version: slot.identity.version.clone(),
                strategy: Arc::clone(&slot.strategy),
                experiment_name,
                config_fingerprint: fingerprint,
            });
        }
    }

    grouped
        .into_iter()
        .map(|(key, members)| {
            let identity = match &key {
                BundleKey::Shared { identity, .. } => identity.clone(),
                BundleKey::Suite {
                    suite_id,
                    strategy_name,
                } => format!("{suite_id}:{strategy_name}"),
            };
            let shared = key.is_shared() && members.len() > 1;
            ResearchBundle {
                key,
                identity,
                members,
                shared,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overrides;
    use crate::experiments::suite::ResearchFactory;
    use crate::experiments::testing::StaticResearch;
    use serde_json::json;
    use std::collections::HashMap;

    fn suite(id: &str, shared: Option<&'static str>) -> ExperimentSuite {
        ExperimentSuite::builder(id)
            .research(ResearchFactory::research(move || {
                let research = StaticResearch::new("web");
                match shared {
                    Some(identity) => research.shared(identity),
                    None => research,
                }
            }))
            .build()
            .unwrap()
    }

    fn configured(name: &str, key: &str, value: serde_json::Value) -> HashMap<String, Overrides> {
        let mut table = Overrides::new();
        table.insert(key.to_string(), value);
        let mut map = HashMap::new();
        map.insert(name.to_string(), table);
        map
    }

    #[test]
    fn test_identical_shared_research_collapses() {
        let suites = vec![suite("a", Some("catalog:web")), suite("b", Some("catalog:web"))];
        let bundles = plan_research_bundles(&suites, &ExperimentOverrides::default());
        assert_eq!(bundles.len(), 1);
        assert!(bundles[0].shared);
        assert_eq!(bundles[0].identity, "catalog:web");
        assert_eq!(bundles[0].suite_ids(), vec!["a", "b"]);
        assert_eq!(bundles[0].members[0].config_fingerprint, "default");
    }

    #[test]
    fn test_override_difference_forces_independence() {
        let suites = vec![suite("a", Some("catalog:web")), suite("b", Some("catalog:web"))];
        let overrides = ExperimentOverrides::new(configured(
            "b:research:web",
            "temperature",
            json!(0.3),
        ));
        let bundles = plan_research_bundles(&suites, &overrides);
        assert_eq!(bundles.len(), 2);
        assert!(bundles.iter().all(|b| !b.shared));
    }

    #[test]
    fn test_unshared_strategies_never_collide() {
        let suites = vec![suite("a", None), suite("b", None)];
        let bundles = plan_research_bundles(&suites, &ExperimentOverrides::default());
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].identity, "a:web");
        assert_eq!(bundles[1].identity, "b:web");
    }

    #[test]
    fn test_single_member_shared_key_is_not_shared() {
        let suites = vec![suite("z", None), suite("a", Some("catalog:web"))];
        let bundles = plan_research_bundles(&suites, &ExperimentOverrides::default());
        assert_eq!(bundles.len(), 2);
        // shared keys sort first
        assert!(bundles[0].key.is_shared());
        assert!(!bundles[0].shared);
        assert_eq!(bundles[1].identity, "z:web");
    }
}
