//! Project layout inside the sandbox root.
//!
//! ```text
//! <workspace>/
//!   kiln.toml
//!   <project>/              working directory of the agent, watched for changes
//!     .kiln/
//!       session.json        continuation token
//!       transcript.jsonl    append-only conversation log
//!       usage.jsonl         append-only usage ledger
//!       guardrails.toml     per-project guardrail settings
//!       agent-home/         isolated agent config directory
//! ```

use std::path::{Component, Path, PathBuf};

use crate::errors::{ConfigError, KilnError};

/// Name of the per-project private directory.
pub const PRIVATE_DIR: &str = ".kiln";

const MAX_PROJECT_ID_LEN: usize = 64;

/// Absolute, sandbox-checked paths for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub project: String,
    pub sandbox_root: PathBuf,
    pub root: PathBuf,
    pub private_dir: PathBuf,
    pub agent_home: PathBuf,
}

impl ProjectPaths {
    /// Resolve and validate the paths of `project` below `workspace`.
    pub fn resolve(workspace: &Path, project: &str) -> Result<Self, ConfigError> {
        validate_project_id(project)?;
        let root = workspace.join(project);
        ensure_sandboxed(&root, workspace)?;
        let private_dir = root.join(PRIVATE_DIR);
        let agent_home = private_dir.join("agent-home");

        Ok(Self {
            project: project.to_string(),
            sandbox_root: workspace.to_path_buf(),
            root,
            private_dir,
            agent_home,
        })
    }

    pub fn session_file(&self) -> PathBuf {
        self.private_dir.join("session.json")
    }

    pub fn transcript_file(&self) -> PathBuf {
        self.private_dir.join("transcript.jsonl")
    }

    pub fn usage_file(&self) -> PathBuf {
        self.private_dir.join("usage.jsonl")
    }

    pub fn guardrails_file(&self) -> PathBuf {
        self.private_dir.join("guardrails.toml")
    }

    /// Create the project root, private directory and agent home.
    pub async fn ensure_dirs(&self) -> Result<(), KilnError> {
        tokio::fs::create_dir_all(&self.agent_home)
            .await
            .map_err(|source| KilnError::StoreWrite {
                path: self.agent_home.clone(),
                source,
            })
    }
}

/// Make a workspace directory absolute against the current directory and
/// fold `.` and `..` components without touching the file system.
pub fn absolute_workspace(dir: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(dir)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Project ids become directory names: reject anything that could traverse.
pub fn validate_project_id(id: &str) -> Result<(), ConfigError> {
    let reason = if id.is_empty() {
        Some("must not be empty")
    } else if id.len() > MAX_PROJECT_ID_LEN {
        Some("longer than 64 characters")
    } else if id.starts_with('.') {
        Some("must not start with '.'")
    } else if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Some("only ASCII letters, digits, '-', '_' and '.' are allowed")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ConfigError::InvalidProjectId {
            id: id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// `path` must be absolute, free of `.`/`..` components and strictly below `root`.
pub fn ensure_sandboxed(path: &Path, root: &Path) -> Result<(), ConfigError> {
    for p in [root, path] {
        if !p.is_absolute() {
            return Err(ConfigError::RelativePath { path: p.to_path_buf() });
        }
    }

    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::CurDir));
    if escapes || !path.starts_with(root) || path == root {
        return Err(ConfigError::OutsideSandbox {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_layout() {
        let paths = ProjectPaths::resolve(Path::new("/srv/ws"), "demo").unwrap();
        assert_eq!(paths.root, PathBuf::from("/srv/ws/demo"));
        assert_eq!(paths.private_dir, PathBuf::from("/srv/ws/demo/.kiln"));
        assert_eq!(paths.agent_home, PathBuf::from("/srv/ws/demo/.kiln/agent-home"));
        assert_eq!(paths.session_file(), PathBuf::from("/srv/ws/demo/.kiln/session.json"));
        assert_eq!(paths.guardrails_file(), PathBuf::from("/srv/ws/demo/.kiln/guardrails.toml"));
    }

    #[test]
    fn test_project_id_rejects_traversal() {
        for bad in ["", "..", "../etc", "a/b", "a\\b", ".hidden", "name with space", "x:y"] {
            assert!(validate_project_id(bad).is_err(), "{:?} should be rejected", bad);
        }
        assert!(validate_project_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_absolute_workspace_folds_parent_dirs() {
        assert_eq!(
            absolute_workspace(Path::new("/srv/app/../ws/./kiln")).unwrap(),
            PathBuf::from("/srv/ws/kiln")
        );
        let cwd = std::env::current_dir().unwrap();
        let relative = absolute_workspace(Path::new("../ws")).unwrap();
        assert_eq!(relative, cwd.parent().unwrap_or(&cwd).join("ws"));
        assert!(ProjectPaths::resolve(&relative, "demo").is_ok());
    }

    #[test]
    fn test_project_id_accepts_simple_names() {
        for good in ["demo", "my-project_2", "v1.2"] {
            assert!(validate_project_id(good).is_ok(), "{:?} should be accepted", good);
        }
    }

    #[test]
    fn test_ensure_sandboxed() {
        let root = Path::new("/srv/ws");
        assert!(ensure_sandboxed(Path::new("/srv/ws/demo/.kiln"), root).is_ok());
        assert!(matches!(
            ensure_sandboxed(Path::new("/srv/ws/../etc"), root),
            Err(ConfigError::OutsideSandbox { .. })
        ));
        assert!(matches!(
            ensure_sandboxed(Path::new("/srv/other"), root),
            Err(ConfigError::OutsideSandbox { .. })
        ));
        assert!(matches!(
            ensure_sandboxed(Path::new("/srv/ws"), root),
            Err(ConfigError::OutsideSandbox { .. })
        ));
        assert!(matches!(
            ensure_sandboxed(Path::new("demo"), root),
            Err(ConfigError::RelativePath { .. })
        ));
        assert!(matches!(
            ensure_sandboxed(Path::new("/srv/ws/demo"), Path::new("ws")),
            Err(ConfigError::RelativePath { .. })
        ));
    }

    #[tokio::test]
    async fn test_ensure_dirs_creates_agent_home() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::resolve(dir.path(), "demo").unwrap();
        paths.ensure_dirs().await.unwrap();
        assert!(paths.agent_home.is_dir());
    }
}
