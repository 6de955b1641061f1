//! Session continuity, transcript and usage accounting.

mod session_store;

pub use session_store::SessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Continuation state of a project's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSession {
    pub session_id: String,
    #[serde(default)]
    pub model: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectSession {
    pub fn new(session_id: impl Into<String>, model: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            model,
            updated_at: Utc::now(),
        }
    }
}

/// Token accounting for one invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl UsageRecord {
    /// Add one message's token counts.
    pub fn add(&mut self, other: &UsageRecord) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .saturating_add(other.cache_read_input_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .saturating_add(other.cache_creation_input_tokens);
        if self.model.is_none() {
            self.model = other.model.clone();
        }
    }

    /// Fold in session totals reported at the end of a run.
    ///
    /// Totals already include every message counted by `add`, so each field
    /// keeps the larger of the two values instead of summing.
    pub fn reconcile(&mut self, totals: &UsageRecord) {
        self.input_tokens = self.input_tokens.max(totals.input_tokens);
        self.output_tokens = self.output_tokens.max(totals.output_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .max(totals.cache_read_input_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .max(totals.cache_creation_input_tokens);
        if totals.cost_usd.is_some() {
            self.cost_usd = totals.cost_usd;
        }
        if self.model.is_none() {
            self.model = totals.model.clone();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_read_input_tokens == 0
            && self.cache_creation_input_tokens == 0
            && self.cost_usd.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub author: Author,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<UsageRecord>,
}

impl TranscriptEntry {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            author: Author::User,
            message: message.into(),
            cost: None,
        }
    }

    pub fn agent(message: impl Into<String>, cost: Option<UsageRecord>) -> Self {
        Self {
            timestamp: Utc::now(),
            author: Author::Agent,
            message: message.into(),
            cost,
        }
    }
}

/// One line of `transcript.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub entry: TranscriptEntry,
}

/// One line of `usage.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLedgerRecord {
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub usage: UsageRecord,
}
