//! One agent invocation: `kiln run`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;

use kiln::config::KilnConfig;
use kiln::events::AgentEvent;
use kiln::pipeline::{ExecutionRequest, Services};
use kiln::scheduler::Scheduler;

/// How long to wait for detached collaborator calls before exiting.
const BACKGROUND_GRACE: Duration = Duration::from_secs(15);

pub async fn cmd_run(
    workspace: PathBuf,
    request: ExecutionRequest,
    timeout_secs: Option<u64>,
) -> Result<ExitCode> {
    let mut config = KilnConfig::load(workspace)?;
    if let Some(secs) = timeout_secs {
        config.timeout = Duration::from_secs(secs);
    }
    let services = Services::from_config(&config)?;
    let scheduler = Scheduler::new(config, services);

    let project = request.project.clone();
    let mut invocation = scheduler.execute(request)?;
    tracing::info!(project = %project, invocation = %invocation.id, "invocation started");

    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    let mut interrupted = false;
    let mut failed = false;

    loop {
        tokio::select! {
            event = invocation.events.next() => {
                let Some(event) = event else { break };
                failed = matches!(event, AgentEvent::Error(_));
                let line = serde_json::to_string(&event).context("Failed to serialize event")?;
                println!("{}", line);
            }
            signal = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                signal.context("Failed to listen for Ctrl-C")?;
                let outcome = scheduler.abort(invocation.id);
                tracing::info!(success = outcome.success, "{}", outcome.message);
            }
        }
    }

    if !scheduler.drain_background(BACKGROUND_GRACE).await {
        tracing::warn!("background calls still pending at exit");
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
