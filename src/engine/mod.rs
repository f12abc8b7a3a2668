use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cli::config::RunConfig;
use crate::error::EngineError;
use crate::stats::report::RunOutcome;
use crate::stats::thresholds::{self, Verdict};
use crate::stats::{builtin, MetricKind, Recorder, Registry, RunReport, Sample, Tags};

pub mod control;
pub mod http_client;
pub mod scheduler;
pub mod vu;

use control::RunControl;
use http_client::{HttpTransport, HyperTransport, DEFAULT_REQUEST_TIMEOUT};
use scheduler::Scheduler;
use vu::{Iteration, VuContext, VuOutcome, VuSettings};

/// Floor for `tick_interval` and `threshold_interval`.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Knobs of the orchestrator itself, as opposed to the run options.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How often the scheduler is consulted.
    pub tick_interval: Duration,
    /// How often `abort_on_fail` thresholds are evaluated.
    pub threshold_interval: Duration,
    pub request_timeout: Duration,
    /// Registry shards; defaults to the CPU count.
    pub shards: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            threshold_interval: Duration::from_secs(2),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shards: None,
        }
    }
}

/// A metric a scenario records itself, registered before the first VU starts.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomMetric {
    pub name: String,
    pub kind: MetricKind,
}

impl CustomMetric {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn counter(name: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    pub fn rate(name: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Rate)
    }

    pub fn trend(name: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Trend)
    }

    pub fn gauge(name: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Gauge)
    }
}

/// Everything needed to run one load test.
#[derive(Clone)]
pub struct ScenarioDefinition {
    pub name: String,
    pub config: RunConfig,
    pub iteration: Arc<dyn Iteration>,
    pub metrics: Vec<CustomMetric>,
}

struct ActiveUser {
    id: u64,
    running: Arc<AtomicBool>,
    handle: JoinHandle<VuOutcome>,
}

pub struct Engine {
    transport: Arc<dyn HttpTransport>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            settings: EngineSettings::default(),
        }
    }

    /// Engine backed by the pooled hyper client.
    pub fn with_default_transport(max_vus: u64) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self::new(Arc::new(HyperTransport::for_vus(max_vus)))
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn run(&self, scenario: &ScenarioDefinition) -> Result<RunReport, EngineError> {
        self.run_with_control(scenario, Arc::new(RunControl::new()))
            .await
    }

    /// Run until the plan completes, an abort threshold fails, or `control`
    /// is stopped from outside.
    pub async fn run_with_control(
        &self,
        scenario: &ScenarioDefinition,
        control: Arc<RunControl>,
    ) -> Result<RunReport, EngineError> {
        let config = &scenario.config;
        let scheduler = Scheduler::new(config.plan.clone())?;

        let registry = Arc::new(Registry::with_builtins(
            self.settings
                .shards
                .unwrap_or_else(|| num_cpus::get().clamp(4, 64)),
        ));
        for metric in &scenario.metrics {
            registry.register(&metric.name, metric.kind)?;
        }
        for (name, kind) in &config.metrics {
            registry.register(name, *kind)?;
        }
        for threshold in &config.thresholds {
            if let Some(kind) = registry.kind_of(&threshold.metric) {
                threshold.validate_kind(kind)?;
            }
        }

        let mut base_tags = config.tags.clone();
        base_tags.insert("scenario".into(), scenario.name.clone());
        let vu_settings = VuSettings {
            iterations: config.plan.iterations_per_vu(),
            min_iteration_duration: config.min_iteration_duration,
        };
        let total = config.plan.total_duration();
        let budgeted = vu_settings.iterations.is_some();
        let gauges = registry.recorder(0);

        info!(scenario = %scenario.name, plan = %config.plan, "starting run");
        let started_at = Utc::now();
        let start = Instant::now();
        let mut users: Vec<ActiveUser> = Vec::new();
        let mut next_id: u64 = 1;
        let mut vus_max: u64 = 0;
        let mut last_threshold_check = Duration::ZERO;
        let threshold_interval = self.settings.threshold_interval.max(MIN_INTERVAL);
        let mut ticker = tokio::time::interval(self.settings.tick_interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let elapsed = Instant::now()
                .checked_duration_since(start)
                .ok_or(EngineError::ClockRegression)?;
            if control.is_stopped() || elapsed >= total {
                break;
            }

            // Users that exhausted their iteration budget still count as
            // assigned, so they are never replaced.
            let assigned = users
                .iter()
                .filter(|u| u.running.load(Ordering::Acquire))
                .count() as u64;
            let target = scheduler.target_vus(elapsed);
            if target > assigned {
                for _ in assigned..target {
                    let id = next_id;
                    next_id += 1;
                    let running = Arc::new(AtomicBool::new(true));
                    let ctx = VuContext::new(
                        id,
                        scenario.name.clone(),
                        self.transport.clone(),
                        registry.recorder(id),
                        base_tags.clone(),
                        self.settings.request_timeout,
                    );
                    let handle = tokio::spawn(vu::run_vu(
                        ctx,
                        scenario.iteration.clone(),
                        running.clone(),
                        control.clone(),
                        vu_settings.clone(),
                    ));
                    debug!(vu = id, "spawned virtual user");
                    users.push(ActiveUser {
                        id,
                        running,
                        handle,
                    });
                }
            } else if target < assigned {
                let mut excess = assigned - target;
                for user in users.iter().rev() {
                    if excess == 0 {
                        break;
                    }
                    if user.running.swap(false, Ordering::AcqRel) {
                        debug!(vu = user.id, "retiring virtual user");
                        excess -= 1;
                    }
                }
            }

            // Retired users leave the list once their last iteration is done.
            users.retain(|u| u.running.load(Ordering::Acquire) || !u.handle.is_finished());

            let live = users.iter().filter(|u| !u.handle.is_finished()).count() as u64;
            vus_max = vus_max.max(live);
            record_gauge(&gauges, builtin::VUS, live, &base_tags);
            record_gauge(&gauges, builtin::VUS_MAX, vus_max, &base_tags);

            if budgeted && !users.is_empty() && live == 0 {
                info!("all virtual users completed their iterations");
                break;
            }

            if elapsed.saturating_sub(last_threshold_check) >= threshold_interval {
                last_threshold_check = elapsed;
                check_abort_thresholds(config, &registry, elapsed, &control);
                if control.is_stopped() {
                    break;
                }
            }
        }

        let interrupted = drain(users, config.graceful_stop).await;
        record_gauge(&gauges, builtin::VUS, 0, &base_tags);

        let elapsed = start.elapsed();
        let snapshot = registry.snapshot(elapsed);
        let results = thresholds::evaluate(&config.thresholds, &snapshot);
        let aborted = control
            .reason()
            .or_else(|| control.is_stopped().then(|| "stopped".to_string()));
        let report = RunReport::new(
            RunOutcome {
                scenario: scenario.name.clone(),
                started_at,
                vus_max,
                interrupted_vus: interrupted,
                aborted,
            },
            &snapshot,
            results,
        );
        info!(
            scenario = %scenario.name,
            passed = report.passed,
            duration_secs = report.duration_secs,
            "run finished"
        );
        Ok(report)
    }
}

fn record_gauge(recorder: &Recorder, name: &str, value: u64, tags: &Tags) {
    let sample = Sample::new(name, value as f64).with_tags(tags.clone());
    if let Err(e) = recorder.record(MetricKind::Gauge, sample) {
        warn!(metric = name, error = %e, "dropping sample");
    }
}

fn check_abort_thresholds(
    config: &RunConfig,
    registry: &Registry,
    elapsed: Duration,
    control: &RunControl,
) {
    let due: Vec<_> = config
        .thresholds
        .iter()
        .filter(|t| t.abort_on_fail && elapsed >= t.delay_abort_eval)
        .collect();
    if due.is_empty() {
        return;
    }
    let snapshot = registry.snapshot(elapsed);
    for threshold in due {
        let result = threshold.evaluate(&snapshot);
        if result.verdict == Verdict::Failed {
            warn!(
                metric = %result.metric,
                expression = %result.expression,
                "threshold crossed, aborting run"
            );
            control.abort(format!(
                "threshold {} {} crossed",
                result.metric, result.expression
            ));
            return;
        }
    }
}

/// Retire every user and wait up to `graceful_stop` for them to finish.
/// Returns how many had to be interrupted.
async fn drain(users: Vec<ActiveUser>, graceful_stop: Duration) -> u64 {
    for user in &users {
        user.running.store(false, Ordering::Release);
    }
    if !users.is_empty() {
        debug!(
            users = users.len(),
            graceful_stop = ?graceful_stop,
            "waiting for virtual users to finish"
        );
    }
    let deadline = Instant::now() + graceful_stop;
    let mut interrupted = 0;
    for mut user in users {
        match tokio::time::timeout_at(deadline, &mut user.handle).await {
            Ok(Ok(outcome)) => {
                debug!(vu = outcome.id, iterations = outcome.iterations, errors = outcome.errors, "virtual user drained");
            }
            Ok(Err(e)) => warn!(vu = user.id, error = %e, "virtual user task failed"),
            Err(_) => {
                user.handle.abort();
                interrupted += 1;
                warn!(vu = user.id, "graceful stop expired, interrupting virtual user");
            }
        }
    }
    interrupted
}
