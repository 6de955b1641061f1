//! Typed error hierarchy for Kiln.
//!
//! Two enums cover the pipeline:
//! - `ConfigError`: fatal configuration problems raised before any subprocess starts
//! - `KilnError`: everything the scheduler, launcher and store can surface
//!
//! Collaborator failures (guardrails, memory, budget) never show up here: they
//! are logged and the pipeline fails open.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration errors. Raised before a subprocess is spawned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid project id '{id}': {reason}")]
    InvalidProjectId { id: String, reason: &'static str },

    #[error("Path {path} is not absolute")]
    RelativePath { path: PathBuf },

    #[error("Path {path} escapes the sandbox root {root}")]
    OutsideSandbox { path: PathBuf, root: PathBuf },

    #[error("Resume requested without a continuation token")]
    ResumeWithoutToken,

    #[error("Failed to load configuration from {path}: {message}")]
    Load { path: PathBuf, message: String },
}

/// Errors from the execution pipeline.
#[derive(Debug, Error)]
pub enum KilnError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Failed to read {path}: {source}")]
    StoreRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt record in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    /// True for errors that must stop an invocation before anything is spawned.
    pub fn is_config(&self) -> bool {
        matches!(self, KilnError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_failed_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "claude not found");
        let err = KilnError::SpawnFailed(io_err);
        match &err {
            KilnError::SpawnFailed(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            _ => panic!("Expected SpawnFailed variant"),
        }
        assert!(!err.is_config());
    }

    #[test]
    fn config_error_converts_into_kiln_error() {
        let err: KilnError = ConfigError::ResumeWithoutToken.into();
        assert!(err.is_config());
        assert!(err.to_string().contains("continuation token"));
    }

    #[test]
    fn outside_sandbox_carries_both_paths() {
        let err = ConfigError::OutsideSandbox {
            path: PathBuf::from("/etc/passwd"),
            root: PathBuf::from("/srv/workspace"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/etc/passwd"));
        assert!(msg.contains("/srv/workspace"));
    }

    #[test]
    fn store_write_carries_path() {
        let path = PathBuf::from("/srv/workspace/demo/.kiln/session.json");
        let err = KilnError::StoreWrite {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        match &err {
            KilnError::StoreWrite { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected StoreWrite"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConfigError::ResumeWithoutToken);
        assert_std_error(&KilnError::Other(anyhow::anyhow!("x")));
    }
}
