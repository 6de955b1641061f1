//! Post-stage output moderation.

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::OutputGuardrailConfig;
use crate::events::{AgentEvent, OutputGuardrailPayload};

/// Answer of a moderation service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModerationResponse {
    #[serde(default)]
    pub triggered: bool,
    #[serde(default)]
    pub violations: Vec<String>,
    /// Rewritten content. Absent means "unchanged".
    #[serde(default)]
    pub content: Option<String>,
}

/// Reviews the complete agent output once the subprocess has exited.
#[async_trait]
pub trait Moderator: Send + Sync {
    async fn moderate(
        &self,
        project: &str,
        content: &str,
        config: &OutputGuardrailConfig,
    ) -> anyhow::Result<ModerationResponse>;
}

/// Result of the post-stage.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputVerdict {
    pub triggered: bool,
    pub violations: Vec<String>,
    pub content: String,
    pub duration_ms: u64,
}

impl OutputVerdict {
    /// The `output_guardrails_triggered` event, if the moderator flagged anything.
    pub fn event(&self) -> Option<AgentEvent> {
        self.triggered.then(|| {
            AgentEvent::OutputGuardrailsTriggered(OutputGuardrailPayload {
                violations: self.violations.clone(),
                duration_ms: self.duration_ms,
            })
        })
    }
}

/// Run the moderator over `content`. `None` means it failed and the original
/// content should be forwarded unchanged.
pub async fn moderate_output(
    moderator: &dyn Moderator,
    project: &str,
    content: &str,
    config: &OutputGuardrailConfig,
) -> Option<OutputVerdict> {
    let started = Instant::now();
    match moderator.moderate(project, content, config).await {
        Ok(response) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            tracing::debug!(
                project,
                triggered = response.triggered,
                duration_ms,
                "output moderation finished"
            );
            Some(OutputVerdict {
                triggered: response.triggered,
                violations: response.violations,
                content: response.content.unwrap_or_else(|| content.to_string()),
                duration_ms,
            })
        }
        Err(e) => {
            tracing::warn!(project, error = %format!("{:#}", e), "output moderation failed, forwarding original output");
            None
        }
    }
}

#[derive(Debug, Serialize)]
struct ModerationRequest<'a> {
    project: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    labels: &'a [String],
}

/// Moderator backed by an HTTP endpoint (`POST <url>`).
#[derive(Debug, Clone)]
pub struct HttpModerator {
    client: reqwest::Client,
    url: String,
}

impl HttpModerator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build moderation HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Moderator for HttpModerator {
    async fn moderate(
        &self,
        project: &str,
        content: &str,
        config: &OutputGuardrailConfig,
    ) -> anyhow::Result<ModerationResponse> {
        let request = ModerationRequest {
            project,
            content,
            prompt: config.prompt.as_deref(),
            labels: &config.labels,
        };
        self.client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context("Failed to send moderation request")?
            .error_for_status()
            .context("Moderation service returned error status")?
            .json::<ModerationResponse>()
            .await
            .context("Failed to parse moderation response")
    }
}
