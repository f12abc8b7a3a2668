//! Load tests that ship with the binary.

use std::sync::Arc;

use crate::cli::config::Options;
use crate::engine::vu::Iteration;
use crate::engine::{CustomMetric, ScenarioDefinition};
use crate::error::ConfigError;

pub mod cache_invalidation;
pub mod cached_get;
pub mod rate_limit;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000";

/// A named scenario: default options plus a factory for its iteration logic.
pub struct BuiltinScenario {
    pub name: &'static str,
    pub description: &'static str,
    pub options: fn() -> Options,
    build: fn(&str) -> (Arc<dyn Iteration>, Vec<CustomMetric>),
}

pub const ALL: &[BuiltinScenario] = &[
    BuiltinScenario {
        name: cache_invalidation::NAME,
        description: "GET list, POST a customer, GET list again (1 VU x 10 iterations)",
        options: cache_invalidation::options,
        build: cache_invalidation::build,
    },
    BuiltinScenario {
        name: cached_get::NAME,
        description: "Cached GET throughput, ramping 0 -> 10 -> 50 -> 0 VUs over 40s",
        options: cached_get::options,
        build: cached_get::build,
    },
    BuiltinScenario {
        name: rate_limit::NAME,
        description: "25 VUs POSTing for 30s; expects the rate limiter to answer 429",
        options: rate_limit::options,
        build: rate_limit::build,
    },
];

pub fn find(name: &str) -> Option<&'static BuiltinScenario> {
    ALL.iter().find(|s| s.name == name)
}

impl BuiltinScenario {
    /// Resolve the scenario against `base_url`, layering `overrides` on top
    /// of its default options.
    pub fn definition(
        &self,
        base_url: &str,
        overrides: Option<Options>,
    ) -> Result<ScenarioDefinition, ConfigError> {
        let defaults = (self.options)();
        let options = match overrides {
            Some(o) => defaults.merge(o),
            None => defaults,
        };
        let config = options.resolve()?;
        let (iteration, metrics) = (self.build)(base_url.trim_end_matches('/'));
        Ok(ScenarioDefinition {
            name: self.name.to_string(),
            config,
            iteration,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_builtin_resolves() {
        for scenario in ALL {
            let definition = scenario.definition(DEFAULT_BASE_URL, None).unwrap();
            assert_eq!(definition.name, scenario.name);
        }
        assert!(find("rate-limit").is_some());
        assert!(find("nope").is_none());
    }

    #[test]
    fn test_overrides_are_applied() {
        let overrides = Options {
            vus: Some(3),
            ..Default::default()
        };
        let definition = find(rate_limit::NAME)
            .unwrap()
            .definition("http://localhost:8080/", Some(overrides))
            .unwrap();
        assert_eq!(definition.config.plan.max_vus(), 3);
        // Scenario thresholds survive the merge.
        assert_eq!(definition.config.thresholds.len(), 3);
    }

    #[test]
    fn test_vus_flag_applies_to_every_builtin() {
        for scenario in ALL {
            let flags = crate::cli::flag_overrides(Some(5), None, None);
            let definition = scenario
                .definition(DEFAULT_BASE_URL, Some(flags))
                .unwrap_or_else(|e| panic!("{}: {}", scenario.name, e));
            assert_eq!(definition.config.plan.max_vus(), 5, "{}", scenario.name);
        }
    }
}
