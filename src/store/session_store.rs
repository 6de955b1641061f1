use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{ProjectSession, TranscriptEntry, TranscriptRecord, UsageLedgerRecord, UsageRecord};
use crate::errors::KilnError;
use crate::sandbox::ProjectPaths;

/// File-backed store under each project's private directory.
///
/// Callers serialize access per project (the scheduler's lane), so there is
/// no locking here.
#[derive(Debug, Clone)]
pub struct SessionStore {
    workspace: PathBuf,
}

impl SessionStore {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    fn paths(&self, project: &str) -> Result<ProjectPaths, KilnError> {
        Ok(ProjectPaths::resolve(&self.workspace, project)?)
    }

    pub async fn read_session(&self, project: &str) -> Result<Option<ProjectSession>, KilnError> {
        let path = self.paths(project)?.session_file();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(KilnError::StoreRead { path, source }),
        };
        let session: ProjectSession = serde_json::from_str(&content)
            .map_err(|source| KilnError::Corrupt { path, source })?;
        if session.session_id.is_empty() {
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Replace the stored session (write to a temp file, then rename).
    pub async fn write_session(
        &self,
        project: &str,
        session: &ProjectSession,
    ) -> Result<(), KilnError> {
        let paths = self.paths(project)?;
        let path = paths.session_file();
        ensure_dir(&paths.private_dir).await?;

        let json = serde_json::to_string_pretty(session)
            .map_err(|e| KilnError::Other(anyhow::anyhow!("Failed to serialize session: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|source| KilnError::StoreWrite {
                path: tmp.clone(),
                source,
            })?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| KilnError::StoreWrite { path, source })
    }

    /// Delete the session. Returns whether a session existed; a missing file is success.
    pub async fn clear_session(&self, project: &str) -> Result<bool, KilnError> {
        let path = self.paths(project)?.session_file();
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(KilnError::StoreWrite { path, source }),
        }
    }

    pub async fn append_transcript(
        &self,
        project: &str,
        session_id: Option<&str>,
        entries: &[TranscriptEntry],
    ) -> Result<(), KilnError> {
        let paths = self.paths(project)?;
        let records = entries.iter().map(|entry| TranscriptRecord {
            session_id: session_id.map(str::to_string),
            entry: entry.clone(),
        });
        append_lines(&paths.private_dir, &paths.transcript_file(), records).await
    }

    /// Most recent `limit` transcript records, oldest first.
    pub async fn read_transcript(
        &self,
        project: &str,
        limit: Option<usize>,
    ) -> Result<Vec<TranscriptRecord>, KilnError> {
        let path = self.paths(project)?.transcript_file();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(KilnError::StoreRead { path, source }),
        };

        let mut records = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let record: TranscriptRecord = serde_json::from_str(line).map_err(|source| {
                KilnError::Corrupt {
                    path: path.clone(),
                    source,
                }
            })?;
            records.push(record);
        }

        if let Some(limit) = limit
            && records.len() > limit
        {
            records.drain(..records.len() - limit);
        }
        Ok(records)
    }

    pub async fn record_usage(&self, project: &str, usage: &UsageRecord) -> Result<(), KilnError> {
        let paths = self.paths(project)?;
        let record = UsageLedgerRecord {
            recorded_at: Utc::now(),
            usage: usage.clone(),
        };
        append_lines(&paths.private_dir, &paths.usage_file(), [record]).await
    }
}

async fn ensure_dir(dir: &Path) -> Result<(), KilnError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|source| KilnError::StoreWrite {
            path: dir.to_path_buf(),
            source,
        })
}

/// Append records as JSON lines in a single write.
async fn append_lines<T: serde::Serialize>(
    dir: &Path,
    path: &Path,
    records: impl IntoIterator<Item = T>,
) -> Result<(), KilnError> {
    let mut buf = String::new();
    for record in records {
        let line = serde_json::to_string(&record)
            .map_err(|e| KilnError::Other(anyhow::anyhow!("Failed to serialize record: {}", e)))?;
        buf.push_str(&line);
        buf.push('\n');
    }
    if buf.is_empty() {
        return Ok(());
    }

    ensure_dir(dir).await?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| KilnError::StoreWrite {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(buf.as_bytes())
        .await
        .map_err(|source| KilnError::StoreWrite {
            path: path.to_path_buf(),
            source,
        })?;
    file.flush().await.map_err(|source| KilnError::StoreWrite {
        path: path.to_path_buf(),
        source,
    })
}
