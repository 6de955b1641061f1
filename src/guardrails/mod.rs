//! Guardrail middleware around an invocation.
//!
//! The pre-stage redacts sensitive data from the prompt before the agent
//! sees it. The optional post-stage hands the complete output to a
//! [`Moderator`] after the agent exits. Both fail open.
//!
//! Per-project settings live in `.kiln/guardrails.toml`:
//!
//! ```toml
//! [input]
//! detectors = ["email", "ip_address", "secret_key"]
//!
//! [output]
//! enabled = true
//! labels = ["pii", "toxicity"]
//! ```

mod detectors;
mod moderation;
mod sanitize;

pub use detectors::{Detector, builtin_detector, builtin_names};
pub use moderation::{HttpModerator, ModerationResponse, Moderator, OutputVerdict, moderate_output};
pub use sanitize::{InputVerdict, redaction, sanitize, sanitize_with};

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::sandbox::ProjectPaths;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputGuardrailConfig {
    /// Enabled detector names. Empty disables the pre-stage.
    #[serde(default)]
    pub detectors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputGuardrailConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Violation labels the moderator should check for
    #[serde(default)]
    pub labels: Vec<String>,
    /// Optional instructions passed through to the moderator
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardrailsToml {
    #[serde(default)]
    pub input: InputGuardrailConfig,
    #[serde(default)]
    pub output: OutputGuardrailConfig,
}

/// Source of per-project guardrail settings.
#[async_trait]
pub trait GuardrailConfigProvider: Send + Sync {
    async fn input_config(&self, project: &str) -> anyhow::Result<InputGuardrailConfig>;
    async fn output_config(&self, project: &str) -> anyhow::Result<OutputGuardrailConfig>;
}

/// Reads `.kiln/guardrails.toml` of each project. A missing file disables
/// both stages.
#[derive(Debug, Clone)]
pub struct FileGuardrailConfig {
    workspace: PathBuf,
}

impl FileGuardrailConfig {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    async fn load(&self, project: &str) -> anyhow::Result<GuardrailsToml> {
        let path = ProjectPaths::resolve(&self.workspace, project)?.guardrails_file();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(GuardrailsToml::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[async_trait]
impl GuardrailConfigProvider for FileGuardrailConfig {
    async fn input_config(&self, project: &str) -> anyhow::Result<InputGuardrailConfig> {
        Ok(self.load(project).await?.input)
    }

    async fn output_config(&self, project: &str) -> anyhow::Result<OutputGuardrailConfig> {
        Ok(self.load(project).await?.output)
    }
}

/// How output reaches the consumer, fixed before the agent starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Live,
    Moderated,
}

impl OutputMode {
    /// Moderated only when enabled for the project and a moderator exists.
    pub fn resolve(config: &OutputGuardrailConfig, has_moderator: bool) -> Self {
        match (config.enabled, has_moderator) {
            (true, true) => OutputMode::Moderated,
            (true, false) => {
                tracing::warn!("output guardrails enabled but no moderator configured, streaming live");
                OutputMode::Live
            }
            _ => OutputMode::Live,
        }
    }
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputMode::Live => write!(f, "live"),
            OutputMode::Moderated => write!(f, "moderated"),
        }
    }
}
