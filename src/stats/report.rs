use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::thresholds::{self, ThresholdResult, Verdict};
use super::{builtin, MetricValues, Snapshot};

/// Process exit status when at least one threshold failed.
pub const THRESHOLDS_FAILED_EXIT_CODE: i32 = 99;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckReport {
    pub passes: u64,
    pub fails: u64,
    pub rate: f64,
}

/// Immutable summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub vus_max: u64,
    /// Users still running when the graceful stop window closed.
    pub interrupted_vus: u64,
    /// Why the run stopped before its plan finished, if it did.
    pub aborted: Option<String>,
    pub metrics: BTreeMap<String, MetricValues>,
    pub checks: BTreeMap<String, CheckReport>,
    pub thresholds: Vec<ThresholdResult>,
    pub passed: bool,
}

pub(crate) struct RunOutcome {
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub vus_max: u64,
    pub interrupted_vus: u64,
    pub aborted: Option<String>,
}

impl RunReport {
    pub(crate) fn new(
        outcome: RunOutcome,
        snapshot: &Snapshot,
        thresholds: Vec<ThresholdResult>,
    ) -> Self {
        let metrics = snapshot
            .metric_names()
            .filter_map(|name| snapshot.values(name).map(|v| (name.to_string(), v)))
            .collect();

        let checks = snapshot
            .group_by(builtin::CHECKS, "check")
            .into_iter()
            .filter_map(|(name, values)| match values {
                MetricValues::Rate {
                    rate,
                    passes,
                    fails,
                } => Some((
                    name,
                    CheckReport {
                        passes,
                        fails,
                        rate,
                    },
                )),
                _ => None,
            })
            .collect();

        let passed = thresholds::all_passed(&thresholds);
        Self {
            run_id: Uuid::new_v4(),
            scenario: outcome.scenario,
            started_at: outcome.started_at,
            duration_secs: snapshot.elapsed().as_secs_f64(),
            vus_max: outcome.vus_max,
            interrupted_vus: outcome.interrupted_vus,
            aborted: outcome.aborted,
            metrics,
            checks,
            thresholds,
            passed,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed {
            0
        } else {
            THRESHOLDS_FAILED_EXIT_CODE
        }
    }

    pub fn counter(&self, name: &str) -> Option<f64> {
        match self.metrics.get(name) {
            Some(MetricValues::Counter { count, .. }) => Some(*count),
            _ => None,
        }
    }

    pub fn rate(&self, name: &str) -> Option<f64> {
        match self.metrics.get(name) {
            Some(MetricValues::Rate { rate, .. }) => Some(*rate),
            _ => None,
        }
    }

    pub fn threshold(&self, metric: &str, expression: &str) -> Option<&ThresholdResult> {
        self.thresholds
            .iter()
            .find(|t| t.metric == metric && t.expression == expression)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn print_summary(&self) {
        println!("\n--- Test Summary: {} ---", self.scenario);
        println!("Duration:   {:.1}s", self.duration_secs);
        println!("VUs (max):  {}", self.vus_max);
        if let Some(reason) = &self.aborted {
            println!("Aborted:    {}", reason);
        }
        if self.interrupted_vus > 0 {
            println!("Interrupted VUs: {}", self.interrupted_vus);
        }

        if !self.checks.is_empty() {
            println!("\nChecks:");
            for (name, check) in &self.checks {
                let mark = if check.fails == 0 { "✓" } else { "✗" };
                println!(
                    "  {} {} : {:.2}% ({} passed, {} failed)",
                    mark,
                    name,
                    check.rate * 100.0,
                    check.passes,
                    check.fails
                );
            }
        }

        println!("\nMetrics:");
        for (name, values) in &self.metrics {
            match values {
                MetricValues::Counter { count, rate } => {
                    println!("  {:<24} {:.0} ({:.2}/s)", name, count, rate);
                }
                MetricValues::Rate {
                    rate,
                    passes,
                    fails,
                } => {
                    if passes + fails > 0 {
                        println!(
                            "  {:<24} {:.2}% ({} of {})",
                            name,
                            rate * 100.0,
                            passes,
                            passes + fails
                        );
                    } else {
                        println!("  {:<24} -", name);
                    }
                }
                MetricValues::Trend {
                    count,
                    avg,
                    min,
                    med,
                    max,
                    p90,
                    p95,
                    ..
                } => {
                    if *count > 0 {
                        println!(
                            "  {:<24} avg={:.2} min={:.2} med={:.2} max={:.2} p(90)={:.2} p(95)={:.2}",
                            name, avg, min, med, max, p90, p95
                        );
                    } else {
                        println!("  {:<24} -", name);
                    }
                }
                MetricValues::Gauge { value, min, max } => {
                    if value.is_nan() {
                        println!("  {:<24} -", name);
                    } else {
                        println!("  {:<24} {} min={} max={}", name, value, min, max);
                    }
                }
            }
        }

        if !self.thresholds.is_empty() {
            println!("\nThresholds:");
            for t in &self.thresholds {
                let mark = match t.verdict {
                    Verdict::Passed => "✓",
                    Verdict::Failed => "✗",
                    Verdict::Inconclusive => "?",
                };
                let actual = t
                    .actual
                    .map(|v| format!("{:.4}", v))
                    .unwrap_or_else(|| "n/a".to_string());
                println!("  {} {} {} (actual: {})", mark, t.metric, t.expression, actual);
            }
        }

        println!(
            "\nResult: {}",
            if self.passed {
                "PASSED"
            } else {
                "FAILED"
            }
        );
        println!("--------------------\n");
    }
}
