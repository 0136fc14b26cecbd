//! Database maintenance commands — `nixopus db`.

use anyhow::{Context, Result};
use nixopus::config::NixopusToml;
use nixopus::deploy::db::DeployDb;

use super::super::DbCommands;

pub fn cmd_db(config: &NixopusToml, command: DbCommands) -> Result<()> {
    match command {
        DbCommands::Init { path } => {
            let db_path = path.unwrap_or_else(|| config.storage.db_path.clone());
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            DeployDb::new(&db_path)?;
            println!("Deployment database initialized at {}", db_path.display());
        }
    }
    Ok(())
}
