//! Threshold expressions (`rate<=1`, `p(95) < 500`, `count>50`) and their evaluation
//! against a registry snapshot.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::{Aggregate, Lookup, MetricKind, Snapshot, Tags};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selector {
    Count,
    Rate,
    Value,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl Selector {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "count" => Some(Selector::Count),
            "rate" => Some(Selector::Rate),
            "value" => Some(Selector::Value),
            "avg" => Some(Selector::Avg),
            "min" => Some(Selector::Min),
            "max" => Some(Selector::Max),
            "med" => Some(Selector::Med),
            _ => {
                let inner = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .or_else(|| s.strip_prefix('p'))?;
                let p: f64 = inner.parse().ok()?;
                (0.0..=100.0).contains(&p).then_some(Selector::Percentile(p))
            }
        }
    }

    /// Whether this selector means anything for a metric of `kind`.
    pub fn supports(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => matches!(self, Selector::Count | Selector::Rate),
            MetricKind::Rate => matches!(self, Selector::Rate),
            MetricKind::Trend => matches!(
                self,
                Selector::Count
                    | Selector::Avg
                    | Selector::Min
                    | Selector::Max
                    | Selector::Med
                    | Selector::Percentile(_)
            ),
            MetricKind::Gauge => matches!(self, Selector::Value | Selector::Min | Selector::Max),
        }
    }

    fn select(&self, agg: &Aggregate, elapsed: Duration) -> f64 {
        match (agg, self) {
            (Aggregate::Counter { sum, .. }, Selector::Count) => *sum,
            (Aggregate::Counter { sum, .. }, Selector::Rate) => super::per_second(*sum, elapsed),
            (Aggregate::Rate { trues, total }, Selector::Rate) => super::ratio(*trues, *total),
            (Aggregate::Trend(t), Selector::Count) => t.count as f64,
            (Aggregate::Trend(t), Selector::Avg) => t.avg(),
            (Aggregate::Trend(t), Selector::Min) => t.exact_or_nan(t.min),
            (Aggregate::Trend(t), Selector::Max) => t.exact_or_nan(t.max),
            (Aggregate::Trend(t), Selector::Med) => t.percentile(50.0),
            (Aggregate::Trend(t), Selector::Percentile(p)) => t.percentile(*p),
            (Aggregate::Gauge { at: None, .. }, _) => f64::NAN,
            (Aggregate::Gauge { value, .. }, Selector::Value) => *value,
            (Aggregate::Gauge { min, .. }, Selector::Min) => *min,
            (Aggregate::Gauge { max, .. }, Selector::Max) => *max,
            _ => f64::NAN,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Count => f.write_str("count"),
            Selector::Rate => f.write_str("rate"),
            Selector::Value => f.write_str("value"),
            Selector::Avg => f.write_str("avg"),
            Selector::Min => f.write_str("min"),
            Selector::Max => f.write_str("max"),
            Selector::Med => f.write_str("med"),
            Selector::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    // Longest tokens first so "<=" is not read as "<".
    const TOKENS: [(&'static str, Comparator); 6] = [
        ("<=", Comparator::Le),
        (">=", Comparator::Ge),
        ("==", Comparator::Eq),
        ("!=", Comparator::Ne),
        ("<", Comparator::Lt),
        (">", Comparator::Gt),
    ];

    /// NaN never satisfies a comparison, `!=` included.
    pub fn apply(&self, actual: f64, operand: f64) -> bool {
        if actual.is_nan() {
            return false;
        }
        match self {
            Comparator::Lt => actual < operand,
            Comparator::Le => actual <= operand,
            Comparator::Gt => actual > operand,
            Comparator::Ge => actual >= operand,
            Comparator::Eq => (actual - operand).abs() < f64::EPSILON,
            Comparator::Ne => (actual - operand).abs() >= f64::EPSILON,
        }
    }

    fn as_str(&self) -> &'static str {
        Self::TOKENS
            .iter()
            .find(|(_, c)| c == self)
            .map(|(s, _)| *s)
            .unwrap_or("?")
    }
}

/// `<selector><comparator><number>`, parsed once at configuration time.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpr {
    pub selector: Selector,
    pub comparator: Comparator,
    pub operand: f64,
}

impl FromStr for ThresholdExpr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let pos = compact
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| "missing comparator".to_string())?;
        let (lhs, rest) = compact.split_at(pos);
        let (token, comparator) = Comparator::TOKENS
            .iter()
            .find(|(token, _)| rest.starts_with(token))
            .ok_or_else(|| format!("unknown comparator in '{}'", rest))?;
        let rhs = &rest[token.len()..];

        let selector =
            Selector::parse(lhs).ok_or_else(|| format!("unknown aggregate selector '{}'", lhs))?;
        let operand: f64 = rhs
            .parse()
            .map_err(|_| format!("'{}' is not a number", rhs))?;
        if !operand.is_finite() {
            return Err(format!("'{}' is not a finite number", rhs));
        }
        Ok(Self {
            selector,
            comparator: *comparator,
            operand,
        })
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.selector, self.comparator.as_str(), self.operand)
    }
}

/// A pass/fail condition on one metric, optionally narrowed to a tagged
/// sub-series (`checks{check:status is 200}`).
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub tags: Tags,
    pub expr: ThresholdExpr,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Duration,
    source: String,
}

impl Threshold {
    pub fn new(metric_key: &str, expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidThreshold {
            metric: metric_key.to_string(),
            expression: expression.to_string(),
            reason,
        };
        let (metric, tags) = parse_metric_key(metric_key).map_err(invalid)?;
        let expr = expression.parse::<ThresholdExpr>().map_err(invalid)?;
        Ok(Self {
            metric,
            tags,
            expr,
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
            source: expression.trim().to_string(),
        })
    }

    pub fn abort_on_fail(mut self, abort: bool) -> Self {
        self.abort_on_fail = abort;
        self
    }

    pub fn delay_abort_eval(mut self, delay: Duration) -> Self {
        self.delay_abort_eval = delay;
        self
    }

    /// Metric name with its tag filter, as written in the options.
    pub fn key(&self) -> String {
        if self.tags.is_empty() {
            return self.metric.clone();
        }
        let tags: Vec<String> = self.tags.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
        format!("{}{{{}}}", self.metric, tags.join(","))
    }

    pub fn expression(&self) -> &str {
        &self.source
    }

    /// Reject selectors that cannot apply to the metric's kind.
    pub fn validate_kind(&self, kind: MetricKind) -> Result<(), ConfigError> {
        if self.expr.selector.supports(kind) {
            Ok(())
        } else {
            Err(ConfigError::InvalidThreshold {
                metric: self.key(),
                expression: self.source.clone(),
                reason: format!("'{}' does not apply to a {} metric", self.expr.selector, kind),
            })
        }
    }

    pub fn evaluate(&self, snapshot: &Snapshot) -> ThresholdResult {
        let (actual, verdict) = match snapshot.lookup(&self.metric, &self.tags) {
            Lookup::NeverInvoked => (None, Verdict::Inconclusive),
            Lookup::Empty(kind) => {
                let actual = self
                    .expr
                    .selector
                    .select(&Aggregate::empty(kind), snapshot.elapsed());
                // No samples fails regardless of the comparison.
                (Some(actual), Verdict::Failed)
            }
            Lookup::Data(agg) => {
                let actual = self.expr.selector.select(&agg, snapshot.elapsed());
                (Some(actual), self.verdict(actual))
            }
        };
        ThresholdResult {
            metric: self.key(),
            expression: self.source.clone(),
            actual: actual.filter(|v| !v.is_nan()),
            verdict,
            abort_on_fail: self.abort_on_fail,
        }
    }

    fn verdict(&self, actual: f64) -> Verdict {
        if self.expr.comparator.apply(actual, self.expr.operand) {
            Verdict::Passed
        } else {
            Verdict::Failed
        }
    }
}

fn parse_metric_key(key: &str) -> Result<(String, Tags), String> {
    let key = key.trim();
    let Some(open) = key.find('{') else {
        if key.is_empty() {
            return Err("empty metric name".to_string());
        }
        return Ok((key.to_string(), Tags::new()));
    };
    let name = key[..open].trim();
    let inner = key[open + 1..]
        .strip_suffix('}')
        .ok_or_else(|| "unterminated tag filter".to_string())?;
    if name.is_empty() {
        return Err("empty metric name".to_string());
    }
    let mut tags = Tags::new();
    for pair in inner.split(',').filter(|p| !p.trim().is_empty()) {
        let (k, v) = pair
            .split_once(':')
            .ok_or_else(|| format!("tag filter '{}' is not key:value", pair.trim()))?;
        tags.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok((name.to_string(), tags))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Passed,
    Failed,
    /// The metric was never registered or recorded; does not fail the run.
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub actual: Option<f64>,
    pub verdict: Verdict,
    pub abort_on_fail: bool,
}

pub fn evaluate(thresholds: &[Threshold], snapshot: &Snapshot) -> Vec<ThresholdResult> {
    thresholds.iter().map(|t| t.evaluate(snapshot)).collect()
}

/// A run passes unless at least one threshold failed.
pub fn all_passed(results: &[ThresholdResult]) -> bool {
    results.iter().all(|r| r.verdict != Verdict::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{builtin, Registry, Sample};

    fn expr(s: &str) -> ThresholdExpr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_expressions() {
        assert_eq!(
            expr("rate<=1"),
            ThresholdExpr {
                selector: Selector::Rate,
                comparator: Comparator::Le,
                operand: 1.0
            }
        );
        assert_eq!(expr("count>50").comparator, Comparator::Gt);
        assert_eq!(expr("p(95) < 500").selector, Selector::Percentile(95.0));
        assert_eq!(expr("p99.9<10").selector, Selector::Percentile(99.9));
        assert_eq!(expr("rate >= 0.99").operand, 0.99);
        assert_eq!(expr("avg!=3").comparator, Comparator::Ne);
        assert_eq!(expr("med==2").comparator, Comparator::Eq);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("rate".parse::<ThresholdExpr>().is_err());
        assert!("latency<5".parse::<ThresholdExpr>().is_err());
        assert!("rate<abc".parse::<ThresholdExpr>().is_err());
        assert!("p(101)<5".parse::<ThresholdExpr>().is_err());
        assert!("rate=>1".parse::<ThresholdExpr>().is_err());
        assert!("count<inf".parse::<ThresholdExpr>().is_err());
    }

    #[test]
    fn test_display_normalizes() {
        assert_eq!(expr("p(95) < 500").to_string(), "p(95)<500");
        assert_eq!(expr("rate >= 0.99").to_string(), "rate>=0.99");
    }

    #[test]
    fn test_threshold_new_reports_config_error() {
        let err = Threshold::new("checks", "rate>>1").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { .. }));
        assert!(Threshold::new("checks{check", "rate>0").is_err());
        assert!(Threshold::new("", "rate>0").is_err());
    }

    #[test]
    fn test_metric_key_with_tags() {
        let t = Threshold::new("checks{check:post is 201/200}", "rate>=0.99").unwrap();
        assert_eq!(t.metric, "checks");
        assert_eq!(t.tags.get("check").map(String::as_str), Some("post is 201/200"));
        assert_eq!(t.key(), "checks{check:post is 201/200}");
    }

    #[test]
    fn test_validate_kind() {
        let t = Threshold::new("responses_429_rate_limited", "count>50").unwrap();
        assert!(t.validate_kind(MetricKind::Counter).is_ok());
        assert!(t.validate_kind(MetricKind::Rate).is_err());
        let p = Threshold::new("http_req_duration", "p(95)<500").unwrap();
        assert!(p.validate_kind(MetricKind::Trend).is_ok());
        assert!(p.validate_kind(MetricKind::Gauge).is_err());
    }

    #[test]
    fn test_nan_never_passes() {
        for cmp in [
            Comparator::Lt,
            Comparator::Le,
            Comparator::Gt,
            Comparator::Ge,
            Comparator::Eq,
            Comparator::Ne,
        ] {
            assert!(!cmp.apply(f64::NAN, 1.0));
        }
    }

    #[test]
    fn test_count_threshold_independent_of_record_calls() {
        let t = Threshold::new("hits", "count>50").unwrap();
        for (calls, each, expect) in [(51, 1.0, true), (1, 51.0, true), (50, 1.0, false), (5, 10.0, false)] {
            let registry = Registry::with_shards(4);
            for _ in 0..calls {
                registry
                    .record(MetricKind::Counter, Sample::new("hits", each))
                    .unwrap();
            }
            let result = t.evaluate(&registry.snapshot(Duration::from_secs(1)));
            assert_eq!(
                result.verdict == Verdict::Passed,
                expect,
                "{} calls of {}",
                calls,
                each
            );
        }
    }

    #[test]
    fn test_never_invoked_is_inconclusive_but_registered_empty_fails() {
        let registry = Registry::with_builtins(2);
        registry
            .register("responses_429_rate_limited", MetricKind::Counter)
            .unwrap();
        let snap = registry.snapshot(Duration::from_secs(30));

        let never = Threshold::new("not_a_metric", "count>50").unwrap().evaluate(&snap);
        assert_eq!(never.verdict, Verdict::Inconclusive);
        assert_eq!(never.actual, None);

        let empty_counter = Threshold::new("responses_429_rate_limited", "count>50")
            .unwrap()
            .evaluate(&snap);
        assert_eq!(empty_counter.verdict, Verdict::Failed);
        assert_eq!(empty_counter.actual, Some(0.0));

        let empty_rate = Threshold::new(builtin::CHECKS, "rate>=0.99").unwrap().evaluate(&snap);
        assert_eq!(empty_rate.verdict, Verdict::Failed);
        assert_eq!(empty_rate.actual, None);

        let empty_trend = Threshold::new(builtin::HTTP_REQ_DURATION, "p(95)<500")
            .unwrap()
            .evaluate(&snap);
        assert_eq!(empty_trend.verdict, Verdict::Failed);

        assert!(all_passed(&[never.clone()]));
        assert!(!all_passed(&[never, empty_counter]));
    }

    #[test]
    fn test_registered_empty_counter_fails_every_comparison() {
        let registry = Registry::with_builtins(2);
        registry.register("errors", MetricKind::Counter).unwrap();
        let snap = registry.snapshot(Duration::from_secs(5));

        for (metric, expression) in [
            ("errors", "count<5"),
            ("errors", "count<=0"),
            ("errors", "count==0"),
            (builtin::HTTP_REQS, "count==0"),
        ] {
            let result = Threshold::new(metric, expression).unwrap().evaluate(&snap);
            assert_eq!(result.verdict, Verdict::Failed, "{} {}", metric, expression);
            assert_eq!(result.actual, Some(0.0));
        }
    }

    #[test]
    fn test_evaluate_against_data() {
        let registry = Registry::with_builtins(4);
        for i in 0..100 {
            registry
                .record(MetricKind::Rate, Sample::new(builtin::HTTP_REQ_FAILED, 0.0))
                .unwrap();
            registry
                .record(
                    MetricKind::Trend,
                    Sample::new(builtin::HTTP_REQ_DURATION, (i + 1) as f64),
                )
                .unwrap();
            let ok = if i == 0 { 0.0 } else { 1.0 };
            registry
                .record(
                    MetricKind::Rate,
                    Sample::new(builtin::CHECKS, ok).tag("check", "status is 200"),
                )
                .unwrap();
        }
        let snap = registry.snapshot(Duration::from_secs(10));
        let thresholds = vec![
            Threshold::new(builtin::HTTP_REQ_FAILED, "rate<=1").unwrap(),
            Threshold::new(builtin::CHECKS, "rate>=0.99").unwrap(),
            Threshold::new("checks{check:status is 200}", "rate>0.995").unwrap(),
            Threshold::new(builtin::HTTP_REQ_DURATION, "p(95)<96").unwrap(),
            Threshold::new(builtin::HTTP_REQ_DURATION, "max<100").unwrap(),
        ];
        let verdicts: Vec<Verdict> = evaluate(&thresholds, &snap)
            .into_iter()
            .map(|r| r.verdict)
            .collect();
        assert_eq!(
            verdicts,
            vec![
                Verdict::Passed,
                Verdict::Passed,
                Verdict::Failed,
                Verdict::Passed,
                Verdict::Failed
            ]
        );
    }
}
