//! Virtual users: the per-user context handed to iteration code and the
//! loop that drives one user until it is retired.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use hyper::body::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::control::RunControl;
use super::http_client::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::error::ConfigError;
use crate::stats::{builtin, MetricKind, Recorder, Sample, Tags};

/// User-defined body of one iteration. Returning an error (or panicking)
/// marks the iteration as failed; the user carries on with the next one.
#[async_trait]
pub trait Iteration: Send + Sync + 'static {
    async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()>;
}

pub struct VuContext {
    id: u64,
    iteration: u64,
    scenario: String,
    transport: Arc<dyn HttpTransport>,
    recorder: Recorder,
    tags: Tags,
    request_timeout: Duration,
    last_response: Option<HttpResponse>,
}

impl VuContext {
    pub(crate) fn new(
        id: u64,
        scenario: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        recorder: Recorder,
        tags: Tags,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id,
            iteration: 0,
            scenario: scenario.into(),
            transport,
            recorder,
            tags,
            request_timeout,
            last_response: None,
        }
    }

    /// Sequence id of this user, starting at 1. Never reused within a run.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Zero-based number of the iteration currently running.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn last_response(&self) -> Option<&HttpResponse> {
        self.last_response.as_ref()
    }

    pub async fn get(&mut self, url: &str) -> HttpResponse {
        self.request(HttpRequest::get(url)).await
    }

    pub async fn post(&mut self, url: &str, body: impl Into<Bytes>) -> HttpResponse {
        self.request(HttpRequest::post(url).body(body)).await
    }

    /// Send a request and record the HTTP metrics for it. Never fails:
    /// transport errors come back as a response with status 0.
    pub async fn request(&mut self, request: HttpRequest) -> HttpResponse {
        let timeout = request.timeout.unwrap_or(self.request_timeout);
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.transport.send(&request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        let duration = started.elapsed();

        let sent = request.wire_size();
        let received = result.as_ref().map_or(0, |r| r.wire_size());
        let response = HttpResponse::from_transport(&request, result, duration);
        if let Some(error) = &response.error {
            debug!(vu = self.id, url = %request.url, error = %error, "request failed");
        }

        let mut tags = self.tags.clone();
        tags.insert("method".into(), request.method.to_string());
        tags.insert(
            "name".into(),
            request.name.clone().unwrap_or_else(|| request.url.clone()),
        );
        tags.insert("status".into(), response.status.to_string());
        tags.extend(request.tags.clone());

        self.emit(MetricKind::Counter, builtin::HTTP_REQS, 1.0, &tags);
        self.emit(
            MetricKind::Trend,
            builtin::HTTP_REQ_DURATION,
            duration.as_secs_f64() * 1000.0,
            &tags,
        );
        self.emit(
            MetricKind::Rate,
            builtin::HTTP_REQ_FAILED,
            bool_value(response.error.is_some()),
            &tags,
        );
        self.emit(MetricKind::Counter, builtin::DATA_SENT, sent as f64, &tags);
        self.emit(MetricKind::Counter, builtin::DATA_RECEIVED, received as f64, &tags);

        self.last_response = Some(response.clone());
        response
    }

    /// Evaluate one named check against `value` and record it in `checks`.
    /// A panicking predicate counts as a failure.
    pub fn check<T: ?Sized>(&self, value: &T, name: &str, predicate: impl FnOnce(&T) -> bool) -> bool {
        let passed = panic::catch_unwind(AssertUnwindSafe(|| predicate(value))).unwrap_or(false);
        let mut tags = self.tags.clone();
        tags.insert("check".into(), name.to_string());
        self.emit(MetricKind::Rate, builtin::CHECKS, bool_value(passed), &tags);
        passed
    }

    /// Like [`check`](Self::check) against the last response of this
    /// iteration. Fails when no request has been made yet.
    pub fn check_last(&self, name: &str, predicate: impl FnOnce(&HttpResponse) -> bool) -> bool {
        match &self.last_response {
            Some(response) => self.check(response, name, predicate),
            None => self.check(&(), name, |_| false),
        }
    }

    /// Suspend this user only.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    pub fn add_counter(&self, name: &str, value: f64) -> Result<(), ConfigError> {
        self.record(MetricKind::Counter, name, value)
    }

    /// Add 1 to a counter.
    pub fn increment(&self, name: &str) -> Result<(), ConfigError> {
        self.add_counter(name, 1.0)
    }

    pub fn add_rate(&self, name: &str, passed: bool) -> Result<(), ConfigError> {
        self.record(MetricKind::Rate, name, bool_value(passed))
    }

    pub fn add_trend(&self, name: &str, value: f64) -> Result<(), ConfigError> {
        self.record(MetricKind::Trend, name, value)
    }

    pub fn set_gauge(&self, name: &str, value: f64) -> Result<(), ConfigError> {
        self.record(MetricKind::Gauge, name, value)
    }

    fn record(&self, kind: MetricKind, name: &str, value: f64) -> Result<(), ConfigError> {
        self.recorder
            .record(kind, Sample::new(name, value).with_tags(self.tags.clone()))
    }

    /// Built-in metrics are registered before any user starts, so a failure
    /// here means a custom metric shadowed one with another kind.
    fn emit(&self, kind: MetricKind, name: &str, value: f64, tags: &Tags) {
        if let Err(e) = self
            .recorder
            .record(kind, Sample::new(name, value).with_tags(tags.clone()))
        {
            warn!(vu = self.id, metric = name, error = %e, "dropping sample");
        }
    }
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct VuSettings {
    /// Stop after this many iterations.
    pub iterations: Option<u64>,
    pub min_iteration_duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VuOutcome {
    pub id: u64,
    pub iterations: u64,
    pub errors: u64,
}

/// Run iterations until the user is retired, the run stops, or the
/// iteration budget is spent. Flags are only consulted between iterations.
pub(crate) async fn run_vu(
    mut ctx: VuContext,
    iteration: Arc<dyn Iteration>,
    running: Arc<AtomicBool>,
    control: Arc<RunControl>,
    settings: VuSettings,
) -> VuOutcome {
    let mut errors = 0;
    loop {
        if !running.load(Ordering::Acquire) || control.is_stopped() {
            break;
        }
        if settings.iterations.is_some_and(|max| ctx.iteration >= max) {
            break;
        }

        ctx.last_response = None;
        let started = Instant::now();
        let result = AssertUnwindSafe(iteration.run(&mut ctx)).catch_unwind().await;
        let elapsed = started.elapsed();

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
        };
        let tags = ctx.tags.clone();
        if let Some(error) = failure {
            errors += 1;
            warn!(vu = ctx.id, iteration = ctx.iteration, error = %error, "iteration failed");
            ctx.emit(MetricKind::Counter, builtin::ITERATION_ERRORS, 1.0, &tags);
        }
        ctx.emit(MetricKind::Counter, builtin::ITERATIONS, 1.0, &tags);
        ctx.emit(
            MetricKind::Trend,
            builtin::ITERATION_DURATION,
            elapsed.as_secs_f64() * 1000.0,
            &tags,
        );
        ctx.iteration += 1;

        if let Some(min) = settings.min_iteration_duration {
            if elapsed < min {
                tokio::time::sleep(min - elapsed).await;
            }
        }
    }
    debug!(vu = ctx.id, iterations = ctx.iteration, "virtual user finished");
    VuOutcome {
        id: ctx.id,
        iterations: ctx.iteration,
        errors,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
