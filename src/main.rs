use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln::command::AgentMode;
use kiln::pipeline::ExecutionRequest;

mod cmd;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "Run a sandboxed coding agent per project and stream its events")]
pub struct Cli {
    /// Workspace root; every project is a directory below it (default: ~/.kiln/workspace)
    #[arg(long, global = true, env = "KILN_WORKSPACE_DIR")]
    pub workspace: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent once and print its events as JSON lines
    Run {
        /// Project id
        #[arg(short, long)]
        project: String,

        /// plan: read-only tools; work: full tool set
        #[arg(long, value_enum, default_value_t = AgentMode::Work)]
        mode: AgentMode,

        /// Model override
        #[arg(long)]
        model: Option<String>,

        /// Use long-term memory for this turn
        #[arg(long)]
        memory: bool,

        /// Maximum agent turns
        #[arg(long)]
        max_turns: Option<u32>,

        /// Do not touch session, transcript, usage or memory
        #[arg(long)]
        no_persist: bool,

        /// Hard timeout in seconds, overrides kiln.toml
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// The prompt
        prompt: String,
    },
    /// Inspect or reset a project's conversation session
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Print a project's stored transcript
    Transcript {
        /// Project id
        #[arg(short, long)]
        project: String,

        /// Only the most recent N entries
        #[arg(long)]
        limit: Option<usize>,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Show configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SessionCommands {
    /// Show the stored continuation token
    Show {
        #[arg(short, long)]
        project: String,
    },
    /// Forget the continuation token; the next run starts a new conversation
    Clear {
        #[arg(short, long)]
        project: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
}

fn resolve_workspace(flag: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match flag {
        Some(dir) => dir,
        None => kiln::config::KilnConfig::default_workspace()
            .context("Cannot determine home directory; pass --workspace")?,
    };
    kiln::sandbox::absolute_workspace(&dir)
        .with_context(|| format!("Failed to resolve workspace {}", dir.display()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let _log_guard = kiln::logging::init(cli.log_json, cli.log_dir.as_deref())?;
    let workspace = resolve_workspace(cli.workspace.clone())?;

    match cli.command {
        Commands::Run {
            project,
            mode,
            model,
            memory,
            max_turns,
            no_persist,
            timeout_secs,
            prompt,
        } => {
            let request = ExecutionRequest {
                project,
                prompt,
                mode,
                model,
                memory,
                max_turns,
                skip_persistence: no_persist,
            };
            return cmd::cmd_run(workspace, request, timeout_secs).await;
        }
        Commands::Session { command } => cmd::cmd_session(workspace, command).await?,
        Commands::Transcript {
            project,
            limit,
            json,
        } => cmd::cmd_transcript(workspace, &project, limit, json).await?,
        Commands::Config { command } => cmd::cmd_config(workspace, command)?,
    }

    Ok(ExitCode::SUCCESS)
}
