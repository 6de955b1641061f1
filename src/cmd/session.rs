//! Session continuity commands: `kiln session`.

use std::path::PathBuf;

use anyhow::Result;

use kiln::config::KilnConfig;
use kiln::pipeline::Services;
use kiln::scheduler::Scheduler;

use super::super::SessionCommands;

pub async fn cmd_session(workspace: PathBuf, command: SessionCommands) -> Result<()> {
    let config = KilnConfig::load(workspace)?;
    let services = Services::local(&config);
    let scheduler = Scheduler::new(config, services);

    match command {
        SessionCommands::Show { project } => match scheduler.store().read_session(&project).await? {
            Some(session) => {
                println!("Session:  {}", session.session_id);
                if let Some(model) = &session.model {
                    println!("Model:    {}", model);
                }
                println!("Updated:  {}", session.updated_at.to_rfc3339());
            }
            None => println!("No session for project '{}'", project),
        },
        SessionCommands::Clear { project } => {
            if scheduler.clear_session(&project).await? {
                println!("Cleared session for project '{}'", project);
            } else {
                println!("No session for project '{}'", project);
            }
        }
    }
    Ok(())
}
