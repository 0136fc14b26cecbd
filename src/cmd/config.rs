//! Configuration view and validation commands — `nixopus config`.

use anyhow::{Context, Result, bail};
use nixopus::config::NixopusToml;

use super::super::ConfigCommands;

pub fn cmd_config(config: &NixopusToml, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
            println!("{rendered}");
        }
        Some(ConfigCommands::Check) => {
            let problems = config.validate();
            if !problems.is_empty() {
                for problem in &problems {
                    eprintln!("  - {problem}");
                }
                bail!("{} configuration problem(s) found", problems.len());
            }
            println!("Configuration is valid.");
        }
    }
    Ok(())
}
