//! File change notifications for a project root.
//!
//! Wraps a `notify` watcher and turns its events into project-relative
//! `file_added` / `file_changed` events. The private `.kiln` directory is
//! never reported.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use notify::event::{CreateKind, EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::events::{AgentEvent, FilePayload};
use crate::sandbox::PRIVATE_DIR;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Added(String),
    Changed(String),
}

impl FileChange {
    pub fn path(&self) -> &str {
        match self {
            FileChange::Added(p) | FileChange::Changed(p) => p,
        }
    }

    pub fn into_event(self) -> AgentEvent {
        match self {
            FileChange::Added(path) => AgentEvent::FileAdded(FilePayload { path }),
            FileChange::Changed(path) => AgentEvent::FileChanged(FilePayload { path }),
        }
    }
}

/// Recursive watcher on one project root. Dropping it stops watching.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<FileChange>,
}

impl FileWatcher {
    pub fn start(root: &Path) -> anyhow::Result<Self> {
        let roots = watch_roots(root);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for change in classify(&roots, &event) {
                        // Receiver gone means the invocation finished.
                        if tx.send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::debug!(error = %e, "file watcher error"),
            }
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    pub async fn recv(&mut self) -> Option<FileChange> {
        self.rx.recv().await
    }

    /// Changes already queued, without waiting.
    pub fn drain(&mut self) -> Vec<FileChange> {
        let mut changes = Vec::new();
        while let Ok(change) = self.rx.try_recv() {
            changes.push(change);
        }
        changes
    }
}

/// The root as given plus its canonical form; some backends report
/// resolved paths (e.g. `/private/var` on macOS).
fn watch_roots(root: &Path) -> Vec<PathBuf> {
    let mut roots = vec![root.to_path_buf()];
    if let Ok(canonical) = root.canonicalize()
        && canonical != root
    {
        roots.push(canonical);
    }
    roots
}

fn classify(roots: &[PathBuf], event: &notify::Event) -> Vec<FileChange> {
    let added = match event.kind {
        EventKind::Create(CreateKind::Folder) => return Vec::new(),
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => false,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter_map(|path| relative_path(roots, path))
        .filter(|(_, abs)| !abs.is_dir())
        .map(|(rel, _)| {
            if added {
                FileChange::Added(rel)
            } else {
                FileChange::Changed(rel)
            }
        })
        .collect()
}

/// `/`-separated path relative to the first matching root, unless it is
/// inside the private directory.
fn relative_path<'a>(roots: &[PathBuf], path: &'a Path) -> Option<(String, &'a Path)> {
    let rel = roots.iter().find_map(|root| path.strip_prefix(root).ok())?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if parts.is_empty() || parts[0] == PRIVATE_DIR {
        return None;
    }
    Some((parts.join("/"), path))
}
