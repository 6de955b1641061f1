//! Cost tracking collaborator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::store::UsageRecord;

#[async_trait]
pub trait BudgetTracker: Send + Sync {
    async fn track_costs(&self, project: &str, input_tokens: u64, output_tokens: u64) -> anyhow::Result<()>;
}

/// Report an invocation's usage without waiting for it. Failures are logged.
pub fn track_detached(
    tasks: &TaskTracker,
    tracker: Arc<dyn BudgetTracker>,
    project: String,
    usage: &UsageRecord,
) -> JoinHandle<()> {
    let (input, output) = (usage.input_tokens, usage.output_tokens);
    tasks.spawn(async move {
        if let Err(e) = tracker.track_costs(&project, input, output).await {
            tracing::warn!(project = %project, error = %format!("{:#}", e), "failed to record costs");
        }
    })
}

#[derive(Debug, Serialize)]
struct CostReport<'a> {
    project: &'a str,
    input_tokens: u64,
    output_tokens: u64,
}

/// Budget service over HTTP: `POST <url>`.
#[derive(Debug, Clone)]
pub struct HttpBudgetTracker {
    client: reqwest::Client,
    url: String,
}

impl HttpBudgetTracker {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build budget HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl BudgetTracker for HttpBudgetTracker {
    async fn track_costs(&self, project: &str, input_tokens: u64, output_tokens: u64) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&CostReport {
                project,
                input_tokens,
                output_tokens,
            })
            .send()
            .await
            .context("Failed to send cost report")?
            .error_for_status()
            .context("Budget service returned error status")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_http_tracker_posts_token_counts() {
        let server = MockServer::start_async().await;
        let endpoint = server
            .mock_async(|when, then| {
                when.method(POST).path("/costs").json_body(json!({
                    "project": "demo",
                    "input_tokens": 120,
                    "output_tokens": 30
                }));
                then.status(200).json_body(json!({}));
            })
            .await;
        let tracker = HttpBudgetTracker::new(server.url("/costs"), Duration::from_secs(5)).unwrap();
        tracker.track_costs("demo", 120, 30).await.unwrap();
        endpoint.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_tracker_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/costs");
                then.status(503);
            })
            .await;
        let tracker = HttpBudgetTracker::new(server.url("/costs"), Duration::from_secs(5)).unwrap();
        assert!(tracker.track_costs("demo", 1, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_detached_failure_is_swallowed() {
        // Nothing listens on this port once the listener is dropped.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/costs", listener.local_addr().unwrap());
        drop(listener);

        let tracker = Arc::new(HttpBudgetTracker::new(url, Duration::from_secs(2)).unwrap());
        let usage = UsageRecord {
            input_tokens: 1,
            ..Default::default()
        };
        track_detached(&TaskTracker::new(), tracker, "demo".into(), &usage)
            .await
            .unwrap();
    }
}
