//! Events delivered to the consumer of an invocation.
//!
//! Serialized as `{"type": "<kind>", "payload": {...}}`. The set of kinds is
//! closed; every variant has its own payload struct.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::store::UsageRecord;

/// Stream of events for one invocation.
pub type EventStream = ReceiverStream<AgentEvent>;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AgentEvent {
    Session(SessionPayload),
    Stdout(StdoutPayload),
    Usage(UsageRecord),
    FileAdded(FilePayload),
    FileChanged(FilePayload),
    ToolCall(ToolCallPayload),
    ToolResult(ToolResultPayload),
    PermissionRequest(PermissionPayload),
    SubagentStart(SubagentStartPayload),
    SubagentEnd(SubagentEndPayload),
    Thinking(ThinkingPayload),
    GuardrailsTriggered(InputGuardrailPayload),
    OutputGuardrailsTriggered(OutputGuardrailPayload),
    Completed(CompletedPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub session_id: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdoutPayload {
    pub text: String,
}

/// Path relative to the project root, `/`-separated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePayload {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    /// Human-readable one-liner, e.g. "Editing: src/main.rs"
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionPayload {
    #[serde(default)]
    pub tool: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentStartPayload {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentEndPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingPayload {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputGuardrailPayload {
    pub detectors: Vec<String>,
    pub matches: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputGuardrailPayload {
    pub violations: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletedPayload {
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageRecord>,
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub timed_out: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl AgentEvent {
    pub fn stdout(text: impl Into<String>) -> Self {
        AgentEvent::Stdout(StdoutPayload { text: text.into() })
    }

    pub fn error(message: impl Into<String>) -> Self {
        AgentEvent::Error(ErrorPayload {
            message: message.into(),
            exit_code: None,
        })
    }

    /// `completed` and `error` close a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Completed(_) | AgentEvent::Error(_))
    }

    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Session(_) => "session",
            AgentEvent::Stdout(_) => "stdout",
            AgentEvent::Usage(_) => "usage",
            AgentEvent::FileAdded(_) => "file_added",
            AgentEvent::FileChanged(_) => "file_changed",
            AgentEvent::ToolCall(_) => "tool_call",
            AgentEvent::ToolResult(_) => "tool_result",
            AgentEvent::PermissionRequest(_) => "permission_request",
            AgentEvent::SubagentStart(_) => "subagent_start",
            AgentEvent::SubagentEnd(_) => "subagent_end",
            AgentEvent::Thinking(_) => "thinking",
            AgentEvent::GuardrailsTriggered(_) => "guardrails_triggered",
            AgentEvent::OutputGuardrailsTriggered(_) => "output_guardrails_triggered",
            AgentEvent::Completed(_) => "completed",
            AgentEvent::Error(_) => "error",
        }
    }
}

/// Producer side of an invocation's stream.
///
/// Accepts events until the first terminal event, then drops everything.
/// A consumer that went away does not stop the invocation: persistence and
/// cleanup still run, the events are just discarded. Ordinary events wait
/// for room but always leave one slot free, so the terminal event never
/// waits on the consumer.
#[derive(Debug)]
pub struct EventSink {
    invocation: Uuid,
    tx: mpsc::Sender<AgentEvent>,
    terminated: bool,
    consumer_gone: bool,
    /// Drop ordinary events instead of waiting for a full channel.
    lossy: bool,
}

impl EventSink {
    pub fn channel(invocation: Uuid) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let sink = Self {
            invocation,
            tx,
            terminated: false,
            consumer_gone: false,
            lossy: false,
        };
        (sink, ReceiverStream::new(rx))
    }

    /// Stop waiting on the consumer. Events that do not fit are dropped;
    /// the terminal event still gets through.
    pub fn stop_waiting(&mut self) {
        if !self.lossy {
            tracing::debug!(invocation = %self.invocation, "event sink no longer waits for the consumer");
        }
        self.lossy = true;
    }

    /// Send an event. Returns false when it was dropped.
    pub async fn emit(&mut self, event: AgentEvent) -> bool {
        if self.terminated {
            tracing::warn!(
                invocation = %self.invocation,
                kind = event.kind(),
                "dropping event after terminal event"
            );
            return false;
        }
        if event.is_terminal() {
            self.terminated = true;
        }
        if self.consumer_gone {
            return false;
        }

        if event.is_terminal() {
            return match self.tx.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(event)) => {
                    tracing::warn!(invocation = %self.invocation, kind = event.kind(), "event channel full, terminal event lost");
                    false
                }
                Err(TrySendError::Closed(_)) => self.gone(),
            };
        }

        if self.lossy {
            if self.tx.capacity() < 2 {
                tracing::debug!(invocation = %self.invocation, kind = event.kind(), "consumer is not reading, dropping event");
                return false;
            }
            return match self.tx.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => false,
                Err(TrySendError::Closed(_)) => self.gone(),
            };
        }

        let closed = match self.tx.reserve_many(2).await {
            Ok(mut permits) => {
                if let Some(permit) = permits.next() {
                    permit.send(event);
                }
                false
            }
            Err(_) => true,
        };
        if closed { self.gone() } else { true }
    }

    pub async fn emit_all(&mut self, events: impl IntoIterator<Item = AgentEvent>) {
        for event in events {
            self.emit(event).await;
        }
    }

    fn gone(&mut self) -> bool {
        tracing::debug!(invocation = %self.invocation, "event consumer went away");
        self.consumer_gone = true;
        false
    }

    #[cfg(test)]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}
