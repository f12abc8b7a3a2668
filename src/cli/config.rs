use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::scheduler::{RunPlan, Stage, DEFAULT_MAX_DURATION};
use crate::error::ConfigError;
use crate::stats::thresholds::Threshold;
use crate::stats::{builtin, MetricKind, Tags};
use crate::utils::parse_duration_str;

/// Default time users get to finish their iteration once the run is over.
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Length of the ramp (e.g. "10s"); "0s" jumps straight to `target`
    pub duration: String,
    /// VU count reached at the end of the stage
    pub target: u64,
}

/// A threshold, either as a bare expression or with abort settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdConfig {
    Expression(String),
    Detailed(DetailedThreshold),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DetailedThreshold {
    pub threshold: String,
    /// Stop the run as soon as this threshold fails
    #[serde(default, alias = "abortOnFail")]
    pub abort_on_fail: bool,
    /// Do not evaluate for aborting before this much run time (e.g. "10s")
    #[serde(default, alias = "delayAbortEval")]
    pub delay_abort_eval: Option<String>,
}

/// Run options as written in a scenario, an options file or on the command line.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Options {
    /// Number of concurrent virtual users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vus: Option<u64>,
    /// Duration of a constant-VU run (e.g. "30s", "1m30s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// Iterations every VU runs before finishing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
    /// Ramping schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<StageConfig>>,
    /// VU count the first stage ramps from
    #[serde(default, alias = "startVUs", skip_serializing_if = "Option::is_none")]
    pub start_vus: Option<u64>,
    /// Upper bound for iteration-budget runs (default 10m)
    #[serde(default, alias = "maxDuration", skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<String>,
    /// Pass/fail criteria keyed by metric, optionally with a tag filter (`checks{check:ok}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<BTreeMap<String, Vec<ThresholdConfig>>>,
    /// Time VUs get to finish their iteration after the run ends (default 30s)
    #[serde(default, alias = "gracefulStop", skip_serializing_if = "Option::is_none")]
    pub graceful_stop: Option<String>,
    /// Minimum time per iteration
    #[serde(default, alias = "minIterationDuration", skip_serializing_if = "Option::is_none")]
    pub min_iteration_duration: Option<String>,
    /// Tags added to every sample
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    /// Custom metrics declared up front: name -> counter | rate | trend | gauge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, String>>,
}

impl Options {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a `.json` file, or YAML for any other extension.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    /// Layer `overrides` on top of `self`.
    ///
    /// Plan options come in three shapes (stages, duration, iterations). When
    /// the override picks a shape, plan fields of the other shapes are dropped
    /// from the base so the result stays unambiguous. A lone `vus` over a
    /// ramping base rescales the stages so their peak is `vus`.
    pub fn merge(mut self, mut overrides: Options) -> Options {
        let ramping = overrides.stages.is_some() || overrides.start_vus.is_some();
        let iterations = overrides.iterations.is_some() || overrides.max_duration.is_some();
        let constant = overrides.duration.is_some() && !iterations;
        if !(ramping || iterations || constant) && self.stages.is_some() {
            if let Some(vus) = overrides.vus.take() {
                self.scale_stages(vus);
            }
        }
        if ramping {
            self.vus = None;
            self.duration = None;
            self.iterations = None;
            self.max_duration = None;
        }
        if constant {
            self.stages = None;
            self.start_vus = None;
            self.iterations = None;
            self.max_duration = None;
        }
        if iterations {
            self.stages = None;
            self.start_vus = None;
        }

        macro_rules! take {
            ($($field:ident),*) => {
                $(if overrides.$field.is_some() {
                    self.$field = overrides.$field;
                })*
            };
        }
        take!(
            vus,
            duration,
            iterations,
            stages,
            start_vus,
            max_duration,
            graceful_stop,
            min_iteration_duration
        );

        // Maps merge per key.
        if let Some(thresholds) = overrides.thresholds {
            self.thresholds.get_or_insert_with(BTreeMap::new).extend(thresholds);
        }
        if let Some(tags) = overrides.tags {
            self.tags.get_or_insert_with(BTreeMap::new).extend(tags);
        }
        if let Some(metrics) = overrides.metrics {
            self.metrics.get_or_insert_with(BTreeMap::new).extend(metrics);
        }
        self
    }

    fn scale_stages(&mut self, vus: u64) {
        let Some(stages) = self.stages.as_mut() else {
            return;
        };
        let peak = stages
            .iter()
            .map(|s| s.target)
            .chain(self.start_vus)
            .max()
            .unwrap_or(0);
        if peak == 0 {
            return;
        }
        let scale = |n: u64| ((n as u128 * vus as u128 + peak as u128 / 2) / peak as u128) as u64;
        for stage in stages.iter_mut() {
            stage.target = scale(stage.target);
        }
        self.start_vus = self.start_vus.map(scale);
    }

    /// Validate and turn into the engine's run configuration.
    pub fn resolve(&self) -> Result<RunConfig, ConfigError> {
        let plan = self.plan()?;
        plan.validate()?;

        let mut metrics = Vec::new();
        for (name, kind) in self.metrics.iter().flatten() {
            metrics.push((name.clone(), MetricKind::from_str(kind)?));
        }

        let mut thresholds = Vec::new();
        for (key, list) in self.thresholds.iter().flatten() {
            for config in list {
                let threshold = match config {
                    ThresholdConfig::Expression(expr) => Threshold::new(key, expr)?,
                    ThresholdConfig::Detailed(detailed) => {
                        let mut t = Threshold::new(key, &detailed.threshold)?
                            .abort_on_fail(detailed.abort_on_fail);
                        if let Some(delay) = &detailed.delay_abort_eval {
                            t = t.delay_abort_eval(parse_field("delay_abort_eval", delay)?);
                        }
                        t
                    }
                };
                let known = builtin::kind_of(&threshold.metric).or_else(|| {
                    metrics
                        .iter()
                        .find(|(name, _)| *name == threshold.metric)
                        .map(|(_, kind)| *kind)
                });
                if let Some(kind) = known {
                    threshold.validate_kind(kind)?;
                }
                thresholds.push(threshold);
            }
        }

        let graceful_stop = match &self.graceful_stop {
            Some(s) => parse_field("graceful_stop", s)?,
            None => DEFAULT_GRACEFUL_STOP,
        };
        let min_iteration_duration = self
            .min_iteration_duration
            .as_deref()
            .map(|s| parse_field("min_iteration_duration", s))
            .transpose()?;

        Ok(RunConfig {
            plan,
            thresholds,
            graceful_stop,
            min_iteration_duration,
            tags: self.tags.clone().unwrap_or_default(),
            metrics,
        })
    }

    fn plan(&self) -> Result<RunPlan, ConfigError> {
        if let Some(stages) = &self.stages {
            if self.vus.is_some() || self.duration.is_some() || self.iterations.is_some() {
                return Err(ConfigError::Conflict(
                    "`stages` cannot be combined with `vus`, `duration` or `iterations`".into(),
                ));
            }
            let stages = stages
                .iter()
                .map(|s| Ok(Stage::new(parse_field("stages.duration", &s.duration)?, s.target)))
                .collect::<Result<Vec<_>, ConfigError>>()?;
            return Ok(RunPlan::Ramping {
                start_vus: self.start_vus.unwrap_or(0),
                stages,
            });
        }
        if self.start_vus.is_some() {
            return Err(ConfigError::Conflict("`start_vus` only applies to `stages`".into()));
        }
        if let Some(iterations) = self.iterations {
            // `duration` alongside `iterations` bounds the run like `max_duration`.
            let max_duration = match (&self.max_duration, &self.duration) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Conflict(
                        "set either `max_duration` or `duration` with `iterations`, not both"
                            .into(),
                    ))
                }
                (Some(s), None) => parse_field("max_duration", s)?,
                (None, Some(s)) => parse_field("duration", s)?,
                (None, None) => DEFAULT_MAX_DURATION,
            };
            return Ok(RunPlan::PerVuIterations {
                vus: self.vus.unwrap_or(1),
                iterations,
                max_duration,
            });
        }
        if self.max_duration.is_some() {
            return Err(ConfigError::Conflict(
                "`max_duration` only applies to `iterations`".into(),
            ));
        }
        if let Some(duration) = &self.duration {
            return Ok(RunPlan::Constant {
                vus: self.vus.unwrap_or(1),
                duration: parse_field("duration", duration)?,
            });
        }
        Err(ConfigError::NoPlan)
    }
}

fn parse_field(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration_str(value).ok_or_else(|| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Validated configuration of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub plan: RunPlan,
    pub thresholds: Vec<Threshold>,
    pub graceful_stop: Duration,
    pub min_iteration_duration: Option<Duration>,
    pub tags: Tags,
    /// Custom metrics to register before the first VU starts.
    pub metrics: Vec<(String, MetricKind)>,
}

impl RunConfig {
    pub fn new(plan: RunPlan) -> Self {
        Self {
            plan,
            thresholds: Vec::new(),
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            min_iteration_duration: None,
            tags: Tags::new(),
            metrics: Vec::new(),
        }
    }

    pub fn threshold(mut self, threshold: Threshold) -> Self {
        self.thresholds.push(threshold);
        self
    }

    pub fn graceful_stop(mut self, graceful_stop: Duration) -> Self {
        self.graceful_stop = graceful_stop;
        self
    }
}

impl TryFrom<Options> for RunConfig {
    type Error = ConfigError;

    fn try_from(options: Options) -> Result<Self, Self::Error> {
        options.resolve()
    }
}
