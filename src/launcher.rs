//! Process launcher and event bridge.
//!
//! Spawns a built [`AgentCommand`], pumps both output pipes through the
//! [`StreamParser`] and forwards every event to an [`EventHandler`] as it is
//! produced. File changes under the project root are interleaved. The run
//! ends when the agent exits, the invocation is aborted, or the hard timeout
//! fires; in the last two cases the process is killed.

use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use crate::command::AgentCommand;
use crate::errors::KilnError;
use crate::events::{AgentEvent, EventSink};
use crate::stream::{Channel, StreamParser};
use crate::watcher::{FileChange, FileWatcher};

const READ_CHUNK: usize = 8 * 1024;

/// Receives events while the agent runs.
#[async_trait]
pub trait EventHandler: Send {
    async fn handle(&mut self, event: AgentEvent);
}

#[async_trait]
impl EventHandler for EventSink {
    async fn handle(&mut self, event: AgentEvent) {
        self.emit(event).await;
    }
}

#[async_trait]
impl EventHandler for Vec<AgentEvent> {
    async fn handle(&mut self, event: AgentEvent) {
        self.push(event);
    }
}

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// The process exited on its own. `None` when killed by a signal.
    Exited(Option<i32>),
    Aborted,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub exit: ExitKind,
    pub duration: Duration,
}

/// Run `command` to completion. Only a failed spawn is an error; every
/// other ending is described by the outcome. The parser is not flushed.
pub async fn launch(
    command: &AgentCommand,
    watch_root: Option<&Path>,
    timeout: Duration,
    cancel: &CancellationToken,
    parser: &mut StreamParser,
    handler: &mut dyn EventHandler,
) -> Result<LaunchOutcome, KilnError> {
    let started = Instant::now();

    let mut watcher = watch_root.and_then(|root| match FileWatcher::start(root) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %format!("{:#}", e), "file watcher unavailable, continuing without file events");
            None
        }
    });

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .env_clear()
        .envs(&command.env)
        .current_dir(&command.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(KilnError::SpawnFailed)?;
    tracing::debug!(pid = child.id().unwrap_or(0), "agent process spawned");

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut stopped: Option<ExitKind> = None;
    while stopped.is_none() && (stdout.is_some() || stderr.is_some()) {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf) => match read {
                Some(n) => {
                    let events = parser.feed(Channel::Stdout, &out_buf[..n]);
                    stopped = forward(handler, events, cancel, deadline.as_mut()).await;
                }
                None => stdout = None,
            },
            read = read_chunk(&mut stderr, &mut err_buf) => match read {
                Some(n) => {
                    let events = parser.feed(Channel::Stderr, &err_buf[..n]);
                    stopped = forward(handler, events, cancel, deadline.as_mut()).await;
                }
                None => stderr = None,
            },
            Some(change) = next_change(&mut watcher) => {
                stopped = forward(handler, vec![change.into_event()], cancel, deadline.as_mut()).await;
            }
            _ = cancel.cancelled() => stopped = Some(ExitKind::Aborted),
            _ = &mut deadline => stopped = Some(ExitKind::TimedOut),
        }
    }

    // Pipes can close before the process exits; keep enforcing abort and
    // timeout while waiting.
    let mut status = None;
    if stopped.is_none() {
        tokio::select! {
            biased;
            waited = child.wait() => status = Some(waited),
            _ = cancel.cancelled() => stopped = Some(ExitKind::Aborted),
            _ = &mut deadline => stopped = Some(ExitKind::TimedOut),
        }
    }

    let exit = match stopped {
        Some(kind) => {
            match kind {
                ExitKind::TimedOut => {
                    tracing::warn!(timeout_secs = timeout.as_secs(), "agent timed out, killing")
                }
                _ => tracing::info!("abort requested, killing agent"),
            }
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "kill failed, process already gone");
            }
            if let Err(e) = child.wait().await {
                tracing::debug!(error = %e, "failed to reap killed agent process");
            }
            kind
        }
        None => match status {
            Some(Ok(status)) => ExitKind::Exited(status.code()),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "failed to wait for agent process");
                ExitKind::Exited(None)
            }
            None => ExitKind::Exited(None),
        },
    };

    if let Some(watcher) = watcher.as_mut()
        && stopped.is_none()
    {
        let changes = watcher.drain().into_iter().map(FileChange::into_event).collect();
        forward(handler, changes, cancel, deadline.as_mut()).await;
    }
    drop(watcher);

    Ok(LaunchOutcome {
        exit,
        duration: started.elapsed(),
    })
}

/// Hand events to `handler` unless abort or the deadline fires first. A
/// handler waiting on a consumer that stopped reading must not hold the
/// process alive.
async fn forward(
    handler: &mut dyn EventHandler,
    events: Vec<AgentEvent>,
    cancel: &CancellationToken,
    mut deadline: Pin<&mut Sleep>,
) -> Option<ExitKind> {
    for event in events {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Some(ExitKind::Aborted),
            _ = &mut deadline => return Some(ExitKind::TimedOut),
            _ = handler.handle(event) => {}
        }
    }
    None
}

/// Read from an open pipe; `None` at EOF or on a read error.
async fn read_chunk<R: AsyncReadExt + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> Option<usize> {
    match pipe {
        Some(reader) => match reader.read(buf).await {
            Ok(0) => None,
            Ok(n) => Some(n),
            Err(e) => {
                tracing::debug!(error = %e, "agent pipe read failed");
                None
            }
        },
        None => std::future::pending().await,
    }
}

async fn next_change(watcher: &mut Option<FileWatcher>) -> Option<FileChange> {
    match watcher {
        Some(watcher) => watcher.recv().await,
        None => std::future::pending().await,
    }
}
