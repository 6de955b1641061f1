//! Per-project execution lanes.
//!
//! Every invocation runs as its own task. Work for one project is serialized
//! through that project's lane so two agents never share a working tree or
//! session file; different projects run side by side. Aborts target a
//! single invocation, whether it is running or still queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::KilnConfig;
use crate::errors::KilnError;
use crate::events::{EventSink, EventStream};
use crate::pipeline::{ExecutionRequest, Pipeline, Services, aborted_event};
use crate::sandbox::validate_project_id;
use crate::store::SessionStore;

type Lane = Arc<tokio::sync::Mutex<()>>;

/// A started invocation: its id and the events it produces.
pub struct Invocation {
    pub id: Uuid,
    pub events: EventStream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortOutcome {
    pub success: bool,
    pub message: String,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    pipeline: Pipeline,
    lanes: Mutex<HashMap<String, Lane>>,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn lane(&self, project: &str) -> Lane {
        Arc::clone(locked(&self.lanes).entry(project.to_string()).or_default())
    }

    /// Aborts stop applying to `id` from here on.
    fn unregister(&self, id: Uuid) {
        locked(&self.running).remove(&id);
    }
}

/// A claim on a project's lane, held while queued and while running.
/// Dropping it unregisters the invocation and removes the lane once
/// nobody else holds or waits on it.
struct Slot {
    inner: Arc<Inner>,
    project: String,
    invocation: Option<Uuid>,
    lane: Lane,
}

impl Slot {
    fn new(inner: &Arc<Inner>, project: &str, invocation: Option<Uuid>) -> Self {
        Self {
            lane: inner.lane(project),
            inner: Arc::clone(inner),
            project: project.to_string(),
            invocation,
        }
    }

    async fn acquire(&self) -> tokio::sync::OwnedMutexGuard<()> {
        Arc::clone(&self.lane).lock_owned().await
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(id) = self.invocation {
            self.inner.unregister(id);
        }
        let mut lanes = locked(&self.inner.lanes);
        // The registry entry and this slot are the only holders.
        if Arc::strong_count(&self.lane) <= 2
            && lanes
                .get(&self.project)
                .is_some_and(|lane| Arc::ptr_eq(lane, &self.lane))
        {
            lanes.remove(&self.project);
        }
    }
}

impl Scheduler {
    pub fn new(config: KilnConfig, services: Services) -> Self {
        Self {
            inner: Arc::new(Inner {
                pipeline: Pipeline::new(config, services),
                lanes: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &KilnConfig {
        self.inner.pipeline.config()
    }

    pub fn store(&self) -> &SessionStore {
        self.inner.pipeline.store()
    }

    /// Queue an invocation. Invalid project ids fail here, before anything
    /// is spawned; every later failure arrives as an `error` event.
    pub fn execute(&self, request: ExecutionRequest) -> Result<Invocation, KilnError> {
        validate_project_id(&request.project)?;

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        locked(&self.inner.running).insert(id, cancel.clone());

        let slot = Slot::new(&self.inner, &request.project, Some(id));
        let (mut sink, events) = EventSink::channel(id);
        let inner = Arc::clone(&self.inner);
        tracing::debug!(project = %request.project, invocation = %id, "invocation queued");

        tokio::spawn(async move {
            let queued = Instant::now();
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = slot.acquire() => Some(permit),
            };
            match permit {
                Some(permit) => {
                    let exited = Arc::clone(&inner);
                    inner
                        .pipeline
                        .run(id, request, cancel, &mut sink, move || exited.unregister(id))
                        .await;
                    drop(permit);
                }
                None => {
                    tracing::info!(project = %request.project, invocation = %id, "aborted while queued");
                    sink.emit(aborted_event(queued)).await;
                }
            }
            // Unregister before the stream closes.
            drop(slot);
            drop(sink);
        });

        Ok(Invocation { id, events })
    }

    /// Request an abort. Unknown or finished invocations are not an error.
    pub fn abort(&self, id: Uuid) -> AbortOutcome {
        let token = locked(&self.inner.running).get(&id).cloned();
        match token {
            Some(token) => {
                token.cancel();
                tracing::info!(invocation = %id, "abort requested");
                AbortOutcome {
                    success: true,
                    message: format!("Abort requested for invocation {}", id),
                }
            }
            None => AbortOutcome {
                success: false,
                message: format!("Invocation {} not found or already finished", id),
            },
        }
    }

    /// Forget a project's continuation token. Waits for running work on the
    /// project to settle first. Returns whether a session existed.
    pub async fn clear_session(&self, project: &str) -> Result<bool, KilnError> {
        validate_project_id(project)?;
        let slot = Slot::new(&self.inner, project, None);
        let permit = slot.acquire().await;
        let cleared = self.store().clear_session(project).await;
        drop(permit);
        drop(slot);
        if let Ok(true) = cleared {
            tracing::info!(project, "session cleared");
        }
        cleared
    }

    /// Wait up to `limit` for detached collaborator calls. Returns false if
    /// some were still pending.
    pub async fn drain_background(&self, limit: Duration) -> bool {
        let tasks = self.inner.pipeline.background();
        tasks.close();
        tokio::time::timeout(limit, tasks.wait()).await.is_ok()
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        locked(&self.inner.lanes).len()
    }
}
