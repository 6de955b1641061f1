//! Agent command construction.
//!
//! The agent runs as `sh -c <script>`. The script is built from fixed flags
//! plus shell-quoted configuration values; the prompt and the continuation
//! token are only referenced as `"$KILN_PROMPT"` / `"$KILN_SESSION_ID"` and
//! travel in the environment, so user text never becomes shell syntax.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::PLANNING_TOOLS;
use crate::errors::ConfigError;
use crate::sandbox::ensure_sandboxed;

pub const PROMPT_VAR: &str = "KILN_PROMPT";
pub const SESSION_VAR: &str = "KILN_SESSION_ID";
pub const CONFIG_DIR_VAR: &str = "CLAUDE_CONFIG_DIR";

/// Variables passed through from the parent so the agent can run at all.
pub const BASE_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "TMPDIR"];

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Read-only planning: no edits, no shell.
    Plan,
    #[default]
    Work,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Plan => write!(f, "plan"),
            AgentMode::Work => write!(f, "work"),
        }
    }
}

/// Everything that goes into one agent command.
#[derive(Debug, Clone)]
pub struct CommandPlan {
    pub agent_cmd: String,
    pub sandbox_root: PathBuf,
    pub working_dir: PathBuf,
    pub config_dir: PathBuf,
    pub session_token: Option<String>,
    pub mode: AgentMode,
    pub allowed_tools: Vec<String>,
    pub skip_permissions: bool,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub prompt: String,
    /// Variables forwarded from the parent environment, already resolved.
    pub forwarded_env: Vec<(String, String)>,
}

/// A fully built invocation, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub script: String,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

impl CommandPlan {
    pub fn build(&self) -> Result<AgentCommand, ConfigError> {
        ensure_sandboxed(&self.working_dir, &self.sandbox_root)?;
        ensure_sandboxed(&self.config_dir, &self.sandbox_root)?;
        if matches!(self.session_token.as_deref(), Some(t) if t.trim().is_empty()) {
            return Err(ConfigError::ResumeWithoutToken);
        }

        let script = self.script();
        let mut env: BTreeMap<String, String> = self.forwarded_env.iter().cloned().collect();
        env.insert(PROMPT_VAR.to_string(), self.prompt.clone());
        env.insert(
            CONFIG_DIR_VAR.to_string(),
            self.config_dir.to_string_lossy().into_owned(),
        );
        if let Some(token) = &self.session_token {
            env.insert(SESSION_VAR.to_string(), token.clone());
        }

        Ok(AgentCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.clone()],
            script,
            env,
            cwd: self.working_dir.clone(),
        })
    }

    fn script(&self) -> String {
        let mut words: Vec<String> = vec![
            "exec".to_string(),
            shell_words::quote(&self.agent_cmd).into_owned(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if let Some(model) = &self.model {
            words.push("--model".to_string());
            words.push(shell_words::quote(model).into_owned());
        }
        if let Some(turns) = self.max_turns {
            words.push("--max-turns".to_string());
            words.push(turns.to_string());
        }
        if self.session_token.is_some() {
            words.push("--resume".to_string());
            words.push(format!("\"${}\"", SESSION_VAR));
        }

        match self.mode {
            AgentMode::Plan => {
                words.push("--permission-mode".to_string());
                words.push("plan".to_string());
                words.push("--allowedTools".to_string());
                words.push(shell_words::quote(&PLANNING_TOOLS.join(",")).into_owned());
            }
            AgentMode::Work => {
                if self.skip_permissions {
                    words.push("--dangerously-skip-permissions".to_string());
                }
                if !self.allowed_tools.is_empty() {
                    words.push("--allowedTools".to_string());
                    words.push(shell_words::quote(&self.allowed_tools.join(",")).into_owned());
                }
            }
        }

        // `--print` last: it ends the variadic tool list before the prompt.
        words.push("--print".to_string());
        words.push(format!("\"${}\"", PROMPT_VAR));
        words.join(" ")
    }
}

/// Resolve `names` against `lookup`, keeping only variables that are set.
pub fn forward_env<'a>(
    names: impl IntoIterator<Item = &'a str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<(String, String)> {
    names
        .into_iter()
        .filter_map(|name| lookup(name).map(|value| (name.to_string(), value)))
        .collect()
}

/// Shell-style rendering for logs. Never contains the prompt itself.
pub fn display_command(cmd: &AgentCommand, root: &Path) -> String {
    let cwd = cmd.cwd.strip_prefix(root).unwrap_or(&cmd.cwd);
    format!("(cd {}) {}", cwd.display(), cmd.script)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> CommandPlan {
        CommandPlan {
            agent_cmd: "claude".into(),
            sandbox_root: PathBuf::from("/srv/ws"),
            working_dir: PathBuf::from("/srv/ws/demo"),
            config_dir: PathBuf::from("/srv/ws/demo/.kiln/agent-home"),
            session_token: None,
            mode: AgentMode::Work,
            allowed_tools: Vec::new(),
            skip_permissions: true,
            model: None,
            max_turns: None,
            prompt: "fix the build".into(),
            forwarded_env: vec![("ANTHROPIC_API_KEY".into(), "sk-test".into())],
        }
    }

    #[test]
    fn test_first_turn_has_no_resume() {
        let cmd = plan().build().unwrap();
        assert!(!cmd.script.contains("--resume"));
        assert!(!cmd.env.contains_key(SESSION_VAR));
        assert_eq!(cmd.program, "sh");
        assert_eq!(cmd.args, vec!["-c".to_string(), cmd.script.clone()]);
        assert_eq!(
            cmd.script,
            "exec claude --output-format stream-json --verbose --dangerously-skip-permissions --print \"$KILN_PROMPT\""
        );
    }

    #[test]
    fn test_resume_references_environment() {
        let mut plan = plan();
        plan.session_token = Some("sess-42".into());
        let cmd = plan.build().unwrap();
        assert!(cmd.script.contains("--resume \"$KILN_SESSION_ID\""));
        assert!(!cmd.script.contains("sess-42"));
        assert_eq!(cmd.env.get(SESSION_VAR).map(String::as_str), Some("sess-42"));
    }

    #[test]
    fn test_empty_token_is_rejected() {
        let mut plan = plan();
        plan.session_token = Some("  ".into());
        assert!(matches!(plan.build(), Err(ConfigError::ResumeWithoutToken)));
    }

    #[test]
    fn test_prompt_never_inlined() {
        let mut plan = plan();
        plan.prompt = "$(rm -rf /); `whoami` \"quoted\"".into();
        let cmd = plan.build().unwrap();
        assert!(!cmd.script.contains("whoami"));
        assert_eq!(cmd.env.get(PROMPT_VAR), Some(&plan.prompt));
    }

    #[test]
    fn test_plan_mode_uses_read_only_tools() {
        let mut plan = plan();
        plan.mode = AgentMode::Plan;
        plan.allowed_tools = vec!["Bash".into()];
        let cmd = plan.build().unwrap();
        assert!(cmd.script.contains("--permission-mode plan"));
        assert!(cmd.script.contains("--allowedTools Read,Glob,Grep,WebSearch,WebFetch"));
        assert!(!cmd.script.contains("--dangerously-skip-permissions"));
        assert!(!cmd.script.contains("Bash"));
    }

    #[test]
    fn test_config_values_are_quoted() {
        let mut plan = plan();
        plan.agent_cmd = "/opt/my tools/claude".into();
        plan.model = Some("sonnet; echo pwned".into());
        plan.max_turns = Some(7);
        let cmd = plan.build().unwrap();
        assert!(cmd.script.starts_with("exec '/opt/my tools/claude' "));
        assert!(cmd.script.contains("--model 'sonnet; echo pwned'"));
        assert!(cmd.script.contains("--max-turns 7"));
    }

    #[test]
    fn test_environment_contents() {
        let cmd = plan().build().unwrap();
        assert_eq!(cmd.env.get(PROMPT_VAR).map(String::as_str), Some("fix the build"));
        assert_eq!(
            cmd.env.get(CONFIG_DIR_VAR).map(String::as_str),
            Some("/srv/ws/demo/.kiln/agent-home")
        );
        assert_eq!(cmd.env.get("ANTHROPIC_API_KEY").map(String::as_str), Some("sk-test"));
        assert_eq!(cmd.cwd, PathBuf::from("/srv/ws/demo"));
    }

    #[test]
    fn test_paths_outside_sandbox_are_rejected() {
        let mut escaping = plan();
        escaping.working_dir = PathBuf::from("/srv/ws/../etc");
        assert!(matches!(
            escaping.build(),
            Err(ConfigError::OutsideSandbox { .. })
        ));

        let mut relative = plan();
        relative.config_dir = PathBuf::from("demo/.kiln");
        assert!(matches!(
            relative.build(),
            Err(ConfigError::RelativePath { .. })
        ));
    }

    #[test]
    fn test_forward_env_skips_unset() {
        let forwarded = forward_env(["A", "B"], |name| (name == "A").then(|| "1".to_string()));
        assert_eq!(forwarded, vec![("A".to_string(), "1".to_string())]);
    }
}
