use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

pub mod report;
pub mod thresholds;

pub use report::{CheckReport, RunReport};

/// Tag set attached to a sample. Ordered so equal sets hash and print identically.
pub type Tags = BTreeMap<String, String>;

/// Names of the metrics every run registers up front.
pub mod builtin {
    use super::MetricKind;

    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const CHECKS: &str = "checks";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_ERRORS: &str = "iteration_errors";
    pub const DATA_SENT: &str = "data_sent";
    pub const DATA_RECEIVED: &str = "data_received";
    pub const VUS: &str = "vus";
    pub const VUS_MAX: &str = "vus_max";

    pub const ALL: &[(&str, MetricKind)] = &[
        (HTTP_REQS, MetricKind::Counter),
        (HTTP_REQ_DURATION, MetricKind::Trend),
        (HTTP_REQ_FAILED, MetricKind::Rate),
        (CHECKS, MetricKind::Rate),
        (ITERATIONS, MetricKind::Counter),
        (ITERATION_DURATION, MetricKind::Trend),
        (ITERATION_ERRORS, MetricKind::Counter),
        (DATA_SENT, MetricKind::Counter),
        (DATA_RECEIVED, MetricKind::Counter),
        (VUS, MetricKind::Gauge),
        (VUS_MAX, MetricKind::Gauge),
    ];

    pub fn kind_of(name: &str) -> Option<MetricKind> {
        ALL.iter().find(|(n, _)| *n == name).map(|(_, k)| *k)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic sum
    Counter,
    /// Fraction of non-zero observations
    Rate,
    /// Distribution: count/min/max/avg/percentiles
    Trend,
    /// Last observed value
    Gauge,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
            MetricKind::Gauge => "gauge",
        };
        f.write_str(s)
    }
}

impl FromStr for MetricKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "counter" => Ok(MetricKind::Counter),
            "rate" => Ok(MetricKind::Rate),
            "trend" | "histogram" => Ok(MetricKind::Trend),
            "gauge" => Ok(MetricKind::Gauge),
            _ => Err(ConfigError::UnknownMetricKind(s.to_string())),
        }
    }
}

/// One observation emitted by a virtual user. Never mutated after `record`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: String,
    pub value: f64,
    pub tags: Tags,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            tags: Tags::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

// Trend values are kept in thousandths so millisecond latencies keep
// microsecond resolution inside the integer histogram.
const TREND_SCALE: f64 = 1000.0;

/// Streaming distribution. Count, sum, min and max are exact; percentiles come
/// from an HDR histogram with 3 significant digits (relative error <= 0.1%).
#[derive(Clone)]
pub(crate) struct TrendAgg {
    histogram: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendAgg {
    fn new() -> Self {
        Self {
            histogram: Histogram::<u64>::new(3).expect("3 significant digits is a valid precision"),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        // Negative observations only affect count/sum/min/max.
        let scaled = (value.max(0.0) * TREND_SCALE).round() as u64;
        let _ = self.histogram.record(scaled);
    }

    fn merge(&mut self, other: &TrendAgg) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        let _ = self.histogram.add(&other.histogram);
    }

    fn avg(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.sum / self.count as f64
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        let q = (p / 100.0).clamp(0.0, 1.0);
        let v = self.histogram.value_at_quantile(q) as f64 / TREND_SCALE;
        // The histogram bucket bound can overshoot the exact extremes.
        v.clamp(self.min.max(0.0), self.max.max(0.0))
    }

    fn exact_or_nan(&self, v: f64) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            v
        }
    }
}

#[derive(Clone)]
pub(crate) enum Aggregate {
    Counter { sum: f64, count: u64 },
    Rate { trues: u64, total: u64 },
    Trend(Box<TrendAgg>),
    Gauge {
        value: f64,
        min: f64,
        max: f64,
        at: Option<DateTime<Utc>>,
    },
}

impl Aggregate {
    pub(crate) fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Aggregate::Counter { sum: 0.0, count: 0 },
            MetricKind::Rate => Aggregate::Rate { trues: 0, total: 0 },
            MetricKind::Trend => Aggregate::Trend(Box::new(TrendAgg::new())),
            MetricKind::Gauge => Aggregate::Gauge {
                value: f64::NAN,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                at: None,
            },
        }
    }

    pub(crate) fn kind(&self) -> MetricKind {
        match self {
            Aggregate::Counter { .. } => MetricKind::Counter,
            Aggregate::Rate { .. } => MetricKind::Rate,
            Aggregate::Trend(_) => MetricKind::Trend,
            Aggregate::Gauge { .. } => MetricKind::Gauge,
        }
    }

    fn add(&mut self, value: f64, timestamp: DateTime<Utc>) {
        match self {
            Aggregate::Counter { sum, count } => {
                *sum += value;
                *count += 1;
            }
            Aggregate::Rate { trues, total } => {
                *total += 1;
                // NaN counts as false.
                if value != 0.0 && !value.is_nan() {
                    *trues += 1;
                }
            }
            Aggregate::Trend(t) => t.add(value),
            Aggregate::Gauge {
                value: last,
                min,
                max,
                at,
            } => {
                if at.map_or(true, |prev| timestamp >= prev) {
                    *last = value;
                    *at = Some(timestamp);
                }
                *min = min.min(value);
                *max = max.max(value);
            }
        }
    }

    fn merge(&mut self, other: &Aggregate) {
        match (self, other) {
            (Aggregate::Counter { sum, count }, Aggregate::Counter { sum: s, count: c }) => {
                *sum += s;
                *count += c;
            }
            (Aggregate::Rate { trues, total }, Aggregate::Rate { trues: t, total: n }) => {
                *trues += t;
                *total += n;
            }
            (Aggregate::Trend(a), Aggregate::Trend(b)) => a.merge(b),
            (
                Aggregate::Gauge {
                    value,
                    min,
                    max,
                    at,
                },
                Aggregate::Gauge {
                    value: v,
                    min: lo,
                    max: hi,
                    at: when,
                },
            ) => {
                if let Some(when) = when {
                    if at.map_or(true, |prev| *when >= prev) {
                        *value = *v;
                        *at = Some(*when);
                    }
                }
                *min = min.min(*lo);
                *max = max.max(*hi);
            }
            // Entries are created with a single kind, so shards always agree.
            _ => {}
        }
    }

    /// Number of observations folded into this aggregate.
    pub(crate) fn observations(&self) -> u64 {
        match self {
            Aggregate::Counter { count, .. } => *count,
            Aggregate::Rate { total, .. } => *total,
            Aggregate::Trend(t) => t.count,
            Aggregate::Gauge { at, .. } => u64::from(at.is_some()),
        }
    }

    pub(crate) fn values(&self, elapsed: Duration) -> MetricValues {
        match self {
            Aggregate::Counter { sum, .. } => MetricValues::Counter {
                count: *sum,
                rate: per_second(*sum, elapsed),
            },
            Aggregate::Rate { trues, total } => MetricValues::Rate {
                rate: ratio(*trues, *total),
                passes: *trues,
                fails: total - trues,
            },
            Aggregate::Trend(t) => MetricValues::Trend {
                count: t.count,
                avg: t.avg(),
                min: t.exact_or_nan(t.min),
                med: t.percentile(50.0),
                max: t.exact_or_nan(t.max),
                p90: t.percentile(90.0),
                p95: t.percentile(95.0),
                p99: t.percentile(99.0),
            },
            Aggregate::Gauge { value, min, max, at } => {
                if at.is_some() {
                    MetricValues::Gauge {
                        value: *value,
                        min: *min,
                        max: *max,
                    }
                } else {
                    MetricValues::Gauge {
                        value: f64::NAN,
                        min: f64::NAN,
                        max: f64::NAN,
                    }
                }
            }
        }
    }
}

fn ratio(trues: u64, total: u64) -> f64 {
    if total == 0 {
        f64::NAN
    } else {
        trues as f64 / total as f64
    }
}

fn per_second(sum: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        sum / secs
    } else {
        0.0
    }
}

/// Aggregated values of one metric, as they appear in the run report.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricValues {
    Counter {
        count: f64,
        rate: f64,
    },
    Rate {
        rate: f64,
        passes: u64,
        fails: u64,
    },
    Trend {
        count: u64,
        avg: f64,
        min: f64,
        med: f64,
        max: f64,
        p90: f64,
        p95: f64,
        p99: f64,
    },
    Gauge {
        value: f64,
        min: f64,
        max: f64,
    },
}

struct Shard {
    total: Aggregate,
    series: HashMap<Tags, Aggregate>,
}

impl Shard {
    fn new(kind: MetricKind) -> Self {
        Self {
            total: Aggregate::empty(kind),
            series: HashMap::new(),
        }
    }

    fn add(&mut self, sample: Sample) {
        self.total.add(sample.value, sample.timestamp);
        if !sample.tags.is_empty() {
            let kind = self.total.kind();
            self.series
                .entry(sample.tags)
                .or_insert_with(|| Aggregate::empty(kind))
                .add(sample.value, sample.timestamp);
        }
    }
}

struct MetricEntry {
    kind: MetricKind,
    shards: Vec<Mutex<Shard>>,
}

impl MetricEntry {
    fn new(kind: MetricKind, num_shards: usize) -> Self {
        Self {
            kind,
            shards: (0..num_shards).map(|_| Mutex::new(Shard::new(kind))).collect(),
        }
    }
}

/// Run-scoped metric store.
///
/// Every metric owns its own set of shards, and a writer only locks one shard
/// of one metric, so virtual users recording different metrics never touch
/// the same lock and users recording the same metric spread across shards.
/// The outer map is only write-locked the first time a name is seen.
pub struct Registry {
    metrics: RwLock<HashMap<String, Arc<MetricEntry>>>,
    num_shards: usize,
    next_shard: AtomicUsize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_shards(num_cpus::get().clamp(4, 64))
    }

    pub fn with_shards(num_shards: usize) -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            num_shards: num_shards.max(1),
            next_shard: AtomicUsize::new(0),
        }
    }

    /// Registry pre-populated with the built-in HTTP, check and iteration metrics.
    pub fn with_builtins(num_shards: usize) -> Self {
        let registry = Self::with_shards(num_shards);
        for (name, kind) in builtin::ALL {
            // Fresh registry: binding cannot conflict.
            let _ = registry.register(name, *kind);
        }
        registry
    }

    /// Bind `name` to `kind`. Registering the same name again with the same
    /// kind is a no-op; with a different kind it is a configuration error.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<(), ConfigError> {
        self.entry(name, kind).map(|_| ())
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.metrics.read().get(name).map(|e| e.kind)
    }

    /// Record a sample on a round-robin shard.
    pub fn record(&self, kind: MetricKind, sample: Sample) -> Result<(), ConfigError> {
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed);
        self.record_on(shard, kind, sample)
    }

    /// Handle that always writes to the shard derived from `shard_key`
    /// (virtual users pass their id).
    pub fn recorder(self: &Arc<Self>, shard_key: u64) -> Recorder {
        Recorder {
            registry: self.clone(),
            shard: (shard_key % self.num_shards as u64) as usize,
        }
    }

    fn record_on(&self, shard: usize, kind: MetricKind, sample: Sample) -> Result<(), ConfigError> {
        let entry = self.entry(&sample.metric, kind)?;
        let mut shard = entry.shards[shard % self.num_shards].lock();
        shard.add(sample);
        Ok(())
    }

    fn entry(&self, name: &str, kind: MetricKind) -> Result<Arc<MetricEntry>, ConfigError> {
        let existing = self.metrics.read().get(name).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let mut metrics = self.metrics.write();
                metrics
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(MetricEntry::new(kind, self.num_shards)))
                    .clone()
            }
        };
        if entry.kind != kind {
            return Err(ConfigError::KindMismatch {
                name: name.to_string(),
                bound: entry.kind,
                requested: kind,
            });
        }
        Ok(entry)
    }

    /// Merge every shard of every metric into a point-in-time view.
    pub fn snapshot(&self, elapsed: Duration) -> Snapshot {
        let entries: Vec<(String, Arc<MetricEntry>)> = self
            .metrics
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();

        let mut metrics = BTreeMap::new();
        for (name, entry) in entries {
            let mut total = Aggregate::empty(entry.kind);
            let mut series: HashMap<Tags, Aggregate> = HashMap::new();
            for shard in &entry.shards {
                let shard = shard.lock();
                total.merge(&shard.total);
                for (tags, agg) in &shard.series {
                    series
                        .entry(tags.clone())
                        .or_insert_with(|| Aggregate::empty(entry.kind))
                        .merge(agg);
                }
            }
            metrics.insert(
                name,
                MetricSnapshot {
                    kind: entry.kind,
                    total,
                    series,
                },
            );
        }
        Snapshot { metrics, elapsed }
    }
}

/// Per-virtual-user write handle onto a `Registry`.
#[derive(Clone)]
pub struct Recorder {
    registry: Arc<Registry>,
    shard: usize,
}

impl Recorder {
    pub fn record(&self, kind: MetricKind, sample: Sample) -> Result<(), ConfigError> {
        self.registry.record_on(self.shard, kind, sample)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

pub struct MetricSnapshot {
    pub kind: MetricKind,
    pub(crate) total: Aggregate,
    pub(crate) series: HashMap<Tags, Aggregate>,
}

/// Result of looking a metric up in a snapshot.
pub(crate) enum Lookup {
    /// Nothing ever registered or recorded under this name.
    NeverInvoked,
    /// Registered, but no sample matched.
    Empty(MetricKind),
    Data(Aggregate),
}

pub struct Snapshot {
    metrics: BTreeMap<String, MetricSnapshot>,
    elapsed: Duration,
}

impl Snapshot {
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.metrics.get(name).map(|m| m.kind)
    }

    /// Aggregate values of the whole metric, `None` if it was never registered.
    pub fn values(&self, name: &str) -> Option<MetricValues> {
        self.metrics
            .get(name)
            .map(|m| m.total.values(self.elapsed))
    }

    pub fn counter(&self, name: &str) -> Option<f64> {
        match self.metrics.get(name).map(|m| &m.total) {
            Some(Aggregate::Counter { sum, .. }) => Some(*sum),
            _ => None,
        }
    }

    /// Merge of every series whose tags contain all of `filter`.
    pub(crate) fn lookup(&self, name: &str, filter: &Tags) -> Lookup {
        let Some(metric) = self.metrics.get(name) else {
            return Lookup::NeverInvoked;
        };
        let agg = if filter.is_empty() {
            metric.total.clone()
        } else {
            let mut merged = Aggregate::empty(metric.kind);
            for (tags, agg) in &metric.series {
                if filter.iter().all(|(k, v)| tags.get(k) == Some(v)) {
                    merged.merge(agg);
                }
            }
            merged
        };
        if agg.observations() == 0 {
            Lookup::Empty(metric.kind)
        } else {
            Lookup::Data(agg)
        }
    }

    /// Values of `name` grouped by the value of one tag (e.g. `checks` by `check`).
    pub fn group_by(&self, name: &str, tag: &str) -> BTreeMap<String, MetricValues> {
        let mut groups: BTreeMap<String, Aggregate> = BTreeMap::new();
        if let Some(metric) = self.metrics.get(name) {
            for (tags, agg) in &metric.series {
                if let Some(value) = tags.get(tag) {
                    groups
                        .entry(value.clone())
                        .or_insert_with(|| Aggregate::empty(metric.kind))
                        .merge(agg);
                }
            }
        }
        groups
            .into_iter()
            .map(|(k, agg)| (k, agg.values(self.elapsed)))
            .collect()
    }
}
