//! Hammers a rate-limited write endpoint and expects the limiter to push back.

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::config::{Options, ThresholdConfig};
use crate::engine::http_client::HttpRequest;
use crate::engine::vu::{Iteration, VuContext};
use crate::engine::CustomMetric;

pub const NAME: &str = "rate-limit";

pub const CREATED: &str = "responses_201_created";
pub const RATE_LIMITED: &str = "responses_429_rate_limited";

pub fn options() -> Options {
    let thresholds = [
        ("http_req_failed", "rate<=1"),
        ("checks", "rate>=0.99"),
        // Only 5 writes per minute are allowed per client, so a working
        // limiter produces plenty of 429s.
        (RATE_LIMITED, "count>50"),
    ]
    .into_iter()
    .map(|(metric, expr)| {
        (
            metric.to_string(),
            vec![ThresholdConfig::Expression(expr.to_string())],
        )
    })
    .collect::<BTreeMap<_, _>>();
    Options {
        vus: Some(25),
        duration: Some("30s".into()),
        thresholds: Some(thresholds),
        ..Default::default()
    }
}

pub(crate) fn build(base_url: &str) -> (Arc<dyn Iteration>, Vec<CustomMetric>) {
    (
        Arc::new(RateLimit::new(base_url)),
        vec![CustomMetric::counter(CREATED), CustomMetric::counter(RATE_LIMITED)],
    )
}

pub struct RateLimit {
    url: String,
}

impl RateLimit {
    pub fn new(base_url: &str) -> Self {
        Self {
            url: format!("{}/service-tickets/", base_url),
        }
    }
}

#[async_trait]
impl Iteration for RateLimit {
    async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
        let payload = json!({
            "description": "Stress test ticket",
            "customer_id": 1,
        });
        let res = vu.request(HttpRequest::post(&self.url).json(&payload)?).await;
        match res.status {
            201 => vu.increment(CREATED)?,
            429 => vu.increment(RATE_LIMITED)?,
            _ => {}
        }
        vu.check(&res, "status is 201/200/429", |r| {
            matches!(r.status, 200 | 201 | 429)
        });
        vu.sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::http_client::mock::MockTransport;
    use crate::engine::http_client::TransportResponse;
    use crate::engine::Engine;
    use crate::scenarios;
    use crate::stats::thresholds::Verdict;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Fixed-window limiter: `limit` writes per `window`, 429 afterwards.
    fn limited_backend(limit: usize, window: Duration) -> MockTransport {
        let hits: Mutex<Vec<Instant>> = Mutex::new(Vec::new());
        MockTransport::new(move |_| {
            let now = Instant::now();
            let mut hits = hits.lock();
            hits.retain(|t| now.duration_since(*t) < window);
            if hits.len() < limit {
                hits.push(now);
                Ok(TransportResponse::new(201, "{\"id\":1}"))
            } else {
                Ok(TransportResponse::new(429, "{\"error\":\"rate limit exceeded\"}"))
            }
        })
        .with_latency(Duration::from_millis(2))
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_working_passes_thresholds() {
        let transport = Arc::new(limited_backend(5, Duration::from_secs(60)));
        let definition = scenarios::find(NAME)
            .unwrap()
            .definition("http://svc", None)
            .unwrap();
        let report = Engine::new(transport.clone()).run(&definition).await.unwrap();

        assert_eq!(report.counter(CREATED), Some(5.0));
        assert!(report.counter(RATE_LIMITED).unwrap() > 50.0);
        assert!(report.checks["status is 201/200/429"].rate >= 0.99);
        for t in &report.thresholds {
            assert_eq!(t.verdict, Verdict::Passed, "{} {}", t.metric, t.expression);
        }
        assert!(report.passed);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.vus_max, 25);
        assert!(transport
            .requests()
            .iter()
            .all(|r| r.body_text().contains("Stress test ticket")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_limiter_fails_run() {
        let transport = Arc::new(MockTransport::status(201));
        let short = Options {
            duration: Some("3s".into()),
            ..Default::default()
        };
        let definition = scenarios::find(NAME)
            .unwrap()
            .definition("http://svc", Some(short))
            .unwrap();
        let report = Engine::new(transport).run(&definition).await.unwrap();

        // Never rate limited: the counter is registered but empty, count is 0.
        let limited = report.threshold(RATE_LIMITED, "count>50").unwrap();
        assert_eq!(limited.verdict, Verdict::Failed);
        assert_eq!(limited.actual, Some(0.0));
        assert!(!report.passed);
        assert_eq!(report.exit_code(), 99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_fail_checks() {
        let transport = Arc::new(MockTransport::status(500));
        let short = Options {
            vus: Some(2),
            duration: Some("2s".into()),
            ..Default::default()
        };
        let definition = scenarios::find(NAME)
            .unwrap()
            .definition("http://svc", Some(short))
            .unwrap();
        let report = Engine::new(transport).run(&definition).await.unwrap();
        assert_eq!(
            report.threshold("checks", "rate>=0.99").unwrap().verdict,
            Verdict::Failed
        );
        // HTTP 500 is still a completed request, not a transport failure.
        assert_eq!(report.rate("http_req_failed"), Some(0.0));
    }
}
