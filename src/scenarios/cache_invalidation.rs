//! Verifies that creating a customer invalidates the cached customer list.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::config::Options;
use crate::engine::http_client::HttpRequest;
use crate::engine::vu::{Iteration, VuContext};
use crate::engine::CustomMetric;

pub const NAME: &str = "cache-invalidation";

pub fn options() -> Options {
    Options {
        vus: Some(1),
        iterations: Some(10),
        ..Default::default()
    }
}

pub(crate) fn build(base_url: &str) -> (Arc<dyn Iteration>, Vec<CustomMetric>) {
    (Arc::new(CacheInvalidation::new(base_url)), Vec::new())
}

pub struct CacheInvalidation {
    list_url: String,
    create_url: String,
}

impl CacheInvalidation {
    pub fn new(base_url: &str) -> Self {
        let customers = format!("{}/customers/", base_url);
        Self {
            list_url: customers.clone(),
            create_url: customers,
        }
    }
}

#[async_trait]
impl Iteration for CacheInvalidation {
    async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
        // Warm (or hit) the cache.
        vu.get(&self.list_url).await;

        let n = vu.iteration();
        let payload = json!({
            "name": format!("LoadTest_{}", n),
            "email": format!("loadtest_{}@example.com", n),
            "phone": "317-555-0000",
        });
        let created = vu
            .request(HttpRequest::post(&self.create_url).json(&payload)?)
            .await;
        vu.check(&created, "post is 201/200", |r| matches!(r.status, 200 | 201));

        // Must reflect the new customer if the write cleared the cache.
        vu.get(&self.list_url).await;
        vu.check_last("list is 200", |r| r.status == 200);

        vu.sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}
