//! Transcript view: `kiln transcript`.

use std::path::PathBuf;

use anyhow::{Context, Result};

use kiln::config::KilnConfig;
use kiln::store::{Author, SessionStore};

pub async fn cmd_transcript(
    workspace: PathBuf,
    project: &str,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let config = KilnConfig::load(workspace)?;
    let store = SessionStore::new(&config.workspace_dir);
    let records = store.read_transcript(project, limit).await?;

    if records.is_empty() {
        if !json {
            println!("No transcript for project '{}'", project);
        }
        return Ok(());
    }

    for record in &records {
        if json {
            println!(
                "{}",
                serde_json::to_string(record).context("Failed to serialize transcript record")?
            );
            continue;
        }
        let author = match record.entry.author {
            Author::User => "user",
            Author::Agent => "agent",
        };
        println!(
            "[{}] {}:",
            record.entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            author
        );
        println!("{}", record.entry.message);
        if let Some(cost) = &record.entry.cost {
            println!(
                "  ({} in / {} out tokens{})",
                cost.input_tokens,
                cost.output_tokens,
                cost.cost_usd
                    .map(|usd| format!(", ${:.4}", usd))
                    .unwrap_or_default()
            );
        }
        println!();
    }
    Ok(())
}
