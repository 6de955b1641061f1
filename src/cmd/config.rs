//! Configuration view: `kiln config`.

use std::path::PathBuf;

use anyhow::Result;

use super::super::ConfigCommands;

fn show_optional(value: Option<&str>) -> String {
    value
        .map(|v| format!("\"{}\"", v))
        .unwrap_or_else(|| "(not set)".to_string())
}

fn show_list(values: &[String]) -> String {
    let quoted: Vec<String> = values.iter().map(|v| format!("\"{}\"", v)).collect();
    format!("[{}]", quoted.join(", "))
}

pub fn cmd_config(workspace: PathBuf, command: Option<ConfigCommands>) -> Result<()> {
    use kiln::config::{CONFIG_FILE, KilnConfig};

    match command {
        None | Some(ConfigCommands::Show) => {
            let config_path = workspace.join(CONFIG_FILE);
            let config = KilnConfig::load(workspace)?;

            println!();
            println!("Kiln Configuration");
            println!("==================");
            println!();
            println!("Workspace:   {}", config.workspace_dir.display());
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("Config file: none (defaults + environment)");
            }
            println!();

            println!("[agent]");
            println!("  command = \"{}\"", config.agent_cmd);
            println!("  default_model = {}", show_optional(config.default_model.as_deref()));
            println!("  allowed_tools = {}", show_list(&config.allowed_tools));
            println!("  skip_permissions = {}", config.skip_permissions);
            println!("  credentials = {}", show_list(&config.credentials));
            println!();

            println!("[sandbox]");
            println!("  timeout_secs = {}", config.timeout.as_secs());
            println!();

            println!("[memory]");
            println!("  url = {}", show_optional(config.memory.url.as_deref()));
            println!("  search_limit = {}", config.memory.search_limit);
            println!("  timeout_secs = {}", config.memory.timeout_secs);
            println!();

            for (name, section) in [("moderation", &config.moderation), ("budget", &config.budget)] {
                println!("[{}]", name);
                println!("  url = {}", show_optional(section.url.as_deref()));
                println!("  timeout_secs = {}", section.timeout_secs);
                println!();
            }

            println!(
                "Guardrail detectors: {}",
                kiln::guardrails::builtin_names().join(", ")
            );
            println!();

            println!("Markers:");
            for rule in config.grammar.rules() {
                println!("  {:<20} {} ... {}", rule.kind.as_str(), rule.open, rule.close);
            }
            println!();
        }
    }
    Ok(())
}
