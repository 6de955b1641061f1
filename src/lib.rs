//! Kiln: run a coding agent per project and stream what it does.
//!
//! A [`scheduler::Scheduler`] accepts [`pipeline::ExecutionRequest`]s and
//! serializes them per project. Each invocation sanitizes the prompt,
//! resumes the project's conversation, launches the agent CLI in the
//! project's sandbox directory and turns its output into typed
//! [`events::AgentEvent`]s.

pub mod budget;
pub mod command;
pub mod config;
pub mod errors;
pub mod events;
pub mod guardrails;
pub mod launcher;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod sandbox;
pub mod scheduler;
pub mod signals;
pub mod store;
pub mod stream;
pub mod watcher;
