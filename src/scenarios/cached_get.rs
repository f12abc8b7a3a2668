//! Throughput of a cached list endpoint under a ramping load.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::config::{Options, StageConfig};
use crate::engine::vu::{Iteration, VuContext};
use crate::engine::CustomMetric;

pub const NAME: &str = "cached-get";

pub fn options() -> Options {
    let stage = |duration: &str, target| StageConfig {
        duration: duration.to_string(),
        target,
    };
    Options {
        stages: Some(vec![stage("10s", 10), stage("20s", 50), stage("10s", 0)]),
        ..Default::default()
    }
}

pub(crate) fn build(base_url: &str) -> (Arc<dyn Iteration>, Vec<CustomMetric>) {
    (Arc::new(CachedGet::new(base_url)), Vec::new())
}

pub struct CachedGet {
    url: String,
}

impl CachedGet {
    pub fn new(base_url: &str) -> Self {
        Self {
            url: format!("{}/service-tickets/", base_url),
        }
    }
}

#[async_trait]
impl Iteration for CachedGet {
    async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
        let res = vu.get(&self.url).await;
        vu.check(&res, "status is 200", |r| r.status == 200);
        // "[]" is an empty list.
        vu.check(&res, "response not empty", |r| r.body.len() > 2);
        vu.sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::http_client::mock::MockTransport;
    use crate::engine::http_client::TransportResponse;
    use crate::engine::scheduler::{RunPlan, Stage};
    use crate::engine::Engine;
    use crate::scenarios;
    use crate::stats::MetricValues;

    #[test]
    fn test_default_plan() {
        let config = options().resolve().unwrap();
        assert_eq!(
            config.plan,
            RunPlan::Ramping {
                start_vus: 0,
                stages: vec![
                    Stage::new(Duration::from_secs(10), 10),
                    Stage::new(Duration::from_secs(20), 50),
                    Stage::new(Duration::from_secs(10), 0),
                ],
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_reaches_peak_and_checks_pass() {
        let transport = Arc::new(
            MockTransport::status(200).with_latency(Duration::from_millis(3)),
        );
        let definition = scenarios::find(NAME)
            .unwrap()
            .definition("http://svc", None)
            .unwrap();
        let report = Engine::new(transport.clone()).run(&definition).await.unwrap();

        assert_eq!(report.vus_max, 50);
        assert!(report.duration_secs >= 40.0);
        assert_eq!(report.interrupted_vus, 0);
        assert!(transport
            .requests()
            .iter()
            .all(|r| r.url == "http://svc/service-tickets/"));
        let reqs = report.counter("http_reqs").unwrap();
        assert!(reqs > 1000.0, "only {} requests", reqs);
        assert_eq!(report.checks["status is 200"].fails, 0);
        assert_eq!(report.checks["response not empty"].fails, 0);
        match report.metrics.get("http_req_duration") {
            Some(MetricValues::Trend { min, max, .. }) => {
                assert!(*min >= 2.99 && *max < 4.1, "min {} max {}", min, max);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_body_fails_check() {
        let transport = Arc::new(MockTransport::new(|_| Ok(TransportResponse::new(200, "[]"))));
        let short = Options {
            stages: Some(vec![StageConfig {
                duration: "2s".into(),
                target: 2,
            }]),
            ..Default::default()
        };
        let definition = scenarios::find(NAME)
            .unwrap()
            .definition("http://svc", Some(short))
            .unwrap();
        let report = Engine::new(transport).run(&definition).await.unwrap();
        assert_eq!(report.checks["response not empty"].passes, 0);
        assert!(report.checks["response not empty"].fails > 0);
        assert_eq!(report.checks["status is 200"].fails, 0);
    }
}
