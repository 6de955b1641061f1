//! Long-term memory augmentation.
//!
//! On the first turn of a conversation, facts remembered from earlier
//! conversations of the same project are prepended to the prompt. After a
//! turn completes, the exchange is handed to the memory service in the
//! background. Memory never fails an invocation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFact {
    #[serde(alias = "memory", alias = "text")]
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
}

/// One user/agent exchange to remember.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePair {
    pub user: String,
    pub agent: String,
}

#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn search(&self, project: &str, query: &str, limit: usize) -> anyhow::Result<Vec<MemoryFact>>;

    async fn store(&self, project: &str, pair: &MessagePair, metadata: &Value) -> anyhow::Result<()>;
}

/// Prepend remembered facts to `prompt`. Search failures leave it unchanged.
pub async fn augment_prompt(
    service: &dyn MemoryService,
    project: &str,
    prompt: &str,
    limit: usize,
) -> String {
    match service.search(project, prompt, limit).await {
        Ok(facts) if facts.is_empty() => prompt.to_string(),
        Ok(facts) => {
            tracing::info!(project, facts = facts.len(), "augmenting prompt with memories");
            format_with_context(&facts, prompt)
        }
        Err(e) => {
            tracing::warn!(project, error = %format!("{:#}", e), "memory search failed, prompt unchanged");
            prompt.to_string()
        }
    }
}

pub fn format_with_context(facts: &[MemoryFact], prompt: &str) -> String {
    let mut out = String::from("## Relevant context from earlier conversations\n\n");
    for fact in facts {
        out.push_str("- ");
        out.push_str(fact.content.trim());
        out.push('\n');
    }
    out.push_str("\n## Request\n\n");
    out.push_str(prompt);
    out
}

/// Store an exchange without waiting for it.
pub fn store_detached(
    tasks: &TaskTracker,
    service: Arc<dyn MemoryService>,
    project: String,
    pair: MessagePair,
    metadata: Value,
) -> JoinHandle<()> {
    tasks.spawn(async move {
        match service.store(&project, &pair, &metadata).await {
            Ok(()) => tracing::debug!(project = %project, "stored exchange in memory"),
            Err(e) => {
                tracing::warn!(project = %project, error = %format!("{:#}", e), "failed to store exchange in memory")
            }
        }
    })
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    project: &'a str,
    query: &'a str,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default, alias = "results", alias = "memories")]
    facts: Vec<MemoryFact>,
}

#[derive(Debug, Serialize)]
struct StoreMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StoreRequest<'a> {
    project: &'a str,
    messages: [StoreMessage<'a>; 2],
    metadata: &'a Value,
}

/// Memory service over HTTP: `POST <url>/search` and `POST <url>/memories`.
#[derive(Debug, Clone)]
pub struct HttpMemoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMemoryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build memory HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MemoryService for HttpMemoryClient {
    async fn search(&self, project: &str, query: &str, limit: usize) -> anyhow::Result<Vec<MemoryFact>> {
        let resp: SearchResponse = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&SearchRequest {
                project,
                query,
                limit,
            })
            .send()
            .await
            .context("Failed to send memory search request")?
            .error_for_status()
            .context("Memory search returned error status")?
            .json()
            .await
            .context("Failed to parse memory search response")?;
        Ok(resp.facts.into_iter().take(limit).collect())
    }

    async fn store(&self, project: &str, pair: &MessagePair, metadata: &Value) -> anyhow::Result<()> {
        self.client
            .post(format!("{}/memories", self.base_url))
            .json(&StoreRequest {
                project,
                messages: [
                    StoreMessage {
                        role: "user",
                        content: &pair.user,
                    },
                    StoreMessage {
                        role: "assistant",
                        content: &pair.agent,
                    },
                ],
                metadata,
            })
            .send()
            .await
            .context("Failed to send memory store request")?
            .error_for_status()
            .context("Memory store returned error status")?;
        Ok(())
    }
}
