//! Wire records of the agent CLI's `stream-json` output, and the parser that
//! turns a live byte stream into [`AgentEvent`](crate::events::AgentEvent)s.

mod parser;

pub use parser::{Channel, HeldOutput, StreamParser, TextMode};

use serde::Deserialize;
use serde_json::Value;

use crate::store::UsageRecord;

/// One line of `stream-json` output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireRecord {
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },

    Assistant {
        message: AssistantMessage,
    },

    User {
        #[serde(default)]
        message: Option<UserMessage>,
    },

    StreamEvent {
        event: PartialEvent,
    },

    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        usage: Option<WireUsage>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },

    /// Record types this parser does not know about (rate limit notices etc).
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct UserMessage {
    /// Either a plain string or an array of content blocks.
    #[serde(default)]
    pub content: Value,
}

impl UserMessage {
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            Value::Array(items) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },

    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },

    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },

    Thinking {
        #[serde(default)]
        thinking: String,
    },

    #[serde(other)]
    Other,
}

/// Partial-message events (`--include-partial-messages`).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartialEvent {
    MessageStart {},
    ContentBlockDelta { delta: Delta },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl WireUsage {
    pub fn to_record(&self, model: Option<String>) -> UsageRecord {
        UsageRecord {
            model,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens,
            cost_usd: None,
        }
    }
}

/// Tool result content is either a string or a list of text blocks.
pub fn flatten_tool_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Extract a human-readable description from a tool use
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = || {
        input
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", path()),
        "Write" => format!("Creating: {}", path()),
        "Edit" | "MultiEdit" => format!("Editing: {}", path()),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 40))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {}", cmd)
        }
        "Glob" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("*");
            format!("Searching: {}", pattern)
        }
        "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 30))
                .unwrap_or_else(|| "pattern".to_string());
            format!("Grep: {}", pattern)
        }
        "Task" | "Agent" => format!("Agent: {}", subagent_description(input)),
        _ => name.to_string(),
    }
}

/// Tools that start a sub-agent.
pub fn is_subagent_tool(name: &str) -> bool {
    matches!(name, "Task" | "Agent")
}

pub fn subagent_description(input: &Value) -> String {
    input
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("subagent")
        .to_string()
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate a string with ellipsis, on a char boundary
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut cut = max_len.saturating_sub(3);
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}
