//! Structured signals embedded in the agent's free text.
//!
//! Besides its JSON records, the agent can announce tool calls, permission
//! requests, sub-agent lifecycle and reasoning spans inline:
//!
//! - `<tool_call>{"name": "Bash", "input": {...}}</tool_call>`
//! - `<permission_request>Write to /etc/hosts</permission_request>`
//! - `<thinking>…</thinking>`
//!
//! The tag set is a [`MarkerGrammar`] so it can follow the agent's format
//! without code changes. [`MarkerScanner`] applies it incrementally.

mod grammar;
mod scanner;

pub use grammar::{MarkerGrammar, MarkerRule, SignalKind};
pub use scanner::{MarkerScanner, Segment};
