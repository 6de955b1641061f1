//! Layered configuration for Kiln.
//!
//! Settings come from `kiln.toml` in the workspace root, then environment
//! variables, then CLI flags (applied by the caller).
//!
//! ```toml
//! [agent]
//! command = "claude"
//! default_model = "sonnet"
//! allowed_tools = ["Read", "Edit", "Write", "Bash"]
//! skip_permissions = true
//! credentials = ["ANTHROPIC_API_KEY"]
//!
//! [sandbox]
//! timeout_secs = 1800
//!
//! [memory]
//! url = "http://localhost:8765"
//! search_limit = 5
//!
//! [moderation]
//! url = "http://localhost:8766/moderate"
//!
//! [budget]
//! url = "http://localhost:8767/costs"
//!
//! [[markers]]
//! kind = "permission_request"
//! open = "[[permission]]"
//! close = "[[/permission]]"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::signals::{MarkerGrammar, MarkerRule};

/// File name of the workspace configuration.
pub const CONFIG_FILE: &str = "kiln.toml";

/// Read-only tools offered to the agent in planning mode.
pub const PLANNING_TOOLS: &[&str] = &["Read", "Glob", "Grep", "WebSearch", "WebFetch"];

const DEFAULT_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MEMORY_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent CLI command (default: "claude")
    #[serde(default)]
    pub command: Option<String>,
    /// Model used when a request does not select one
    #[serde(default)]
    pub default_model: Option<String>,
    /// Tools permitted in work mode. Empty means the agent's own default.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Pass `--dangerously-skip-permissions` in work mode
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
    /// Environment variables forwarded to the agent when set
    #[serde(default = "default_credentials")]
    pub credentials: Vec<String>,
}

fn default_skip_permissions() -> bool {
    true
}

fn default_credentials() -> Vec<String> {
    vec![
        "ANTHROPIC_API_KEY".to_string(),
        "ANTHROPIC_BASE_URL".to_string(),
        "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
    ]
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            default_model: None,
            allowed_tools: Vec::new(),
            skip_permissions: default_skip_permissions(),
            credentials: default_credentials(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    /// Hard wall-clock limit for one invocation
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_memory_limit")]
    pub search_limit: usize,
    #[serde(default = "default_service_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_memory_limit() -> usize {
    DEFAULT_MEMORY_LIMIT
}

fn default_service_timeout_secs() -> u64 {
    DEFAULT_SERVICE_TIMEOUT_SECS
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            url: None,
            search_limit: default_memory_limit(),
            timeout_secs: default_service_timeout_secs(),
        }
    }
}

/// Endpoint of an HTTP collaborator (moderation, budget).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_service_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_service_timeout_secs(),
        }
    }
}

/// The complete kiln.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnToml {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub moderation: ServiceSection,
    #[serde(default)]
    pub budget: ServiceSection,
    /// Marker grammar override. Empty means the default grammar.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub markers: Vec<MarkerRule>,
}

impl KilnToml {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load `kiln.toml` from the workspace, or defaults when it does not exist.
    pub fn load_or_default(workspace: &Path) -> Result<Self, ConfigError> {
        let path = workspace.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Load {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Self::parse(&content).map_err(|e| ConfigError::Load {
            path,
            message: format!("{:#}", e),
        })
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cmd) = lookup("CLAUDE_CMD") {
            self.agent.command = Some(cmd);
        }
        if let Some(val) = lookup("SKIP_PERMISSIONS") {
            self.agent.skip_permissions = val != "false";
        }
        if let Some(secs) = lookup("KILN_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.sandbox.timeout_secs = secs;
        }
        if let Some(url) = lookup("KILN_MEMORY_URL") {
            self.memory.url = Some(url);
        }
        if let Some(url) = lookup("KILN_MODERATION_URL") {
            self.moderation.url = Some(url);
        }
        if let Some(url) = lookup("KILN_BUDGET_URL") {
            self.budget.url = Some(url);
        }
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct KilnConfig {
    /// Sandbox root. Every project lives directly below it.
    pub workspace_dir: PathBuf,
    pub agent_cmd: String,
    pub default_model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub skip_permissions: bool,
    pub credentials: Vec<String>,
    pub timeout: Duration,
    pub memory: MemorySection,
    pub moderation: ServiceSection,
    pub budget: ServiceSection,
    pub grammar: MarkerGrammar,
}

impl KilnConfig {
    /// Load configuration for a workspace: file first, then the process environment.
    pub fn load(workspace_dir: PathBuf) -> Result<Self, ConfigError> {
        let mut toml = KilnToml::load_or_default(&workspace_dir)?;
        toml.apply_env(|key| std::env::var(key).ok());
        Self::from_toml(workspace_dir, toml)
    }

    /// Defaults only; no file, no environment.
    pub fn for_workspace(workspace_dir: PathBuf) -> Result<Self, ConfigError> {
        Self::from_toml(workspace_dir, KilnToml::default())
    }

    pub fn from_toml(workspace_dir: PathBuf, toml: KilnToml) -> Result<Self, ConfigError> {
        if !workspace_dir.is_absolute() {
            return Err(ConfigError::RelativePath {
                path: workspace_dir,
            });
        }

        let grammar = if toml.markers.is_empty() {
            MarkerGrammar::default()
        } else {
            MarkerGrammar::new(toml.markers).map_err(|e| ConfigError::Load {
                path: workspace_dir.join(CONFIG_FILE),
                message: e.to_string(),
            })?
        };

        Ok(Self {
            agent_cmd: toml
                .agent
                .command
                .unwrap_or_else(|| "claude".to_string()),
            default_model: toml.agent.default_model,
            allowed_tools: toml.agent.allowed_tools,
            skip_permissions: toml.agent.skip_permissions,
            credentials: toml.agent.credentials,
            timeout: Duration::from_secs(toml.sandbox.timeout_secs),
            memory: toml.memory,
            moderation: toml.moderation,
            budget: toml.budget,
            grammar,
            workspace_dir,
        })
    }

    /// Default workspace: `~/.kiln/workspace`.
    pub fn default_workspace() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".kiln").join("workspace"))
    }
}
