use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use nixopus::config::NixopusToml;
use nixopus::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "nixopus")]
#[command(version, about = "Self-hosted deployment server and live-dev sync client")]
pub struct Cli {
    /// Path to nixopus.toml (defaults to ./nixopus.toml when present)
    #[arg(long, global = true, env = "NIXOPUS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level or filter directive, e.g. "debug" or "nixopus=trace"
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the deployment server (API, webhook and live-dev ingest)
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Stream a working tree to a live-dev environment
    Dev(DevArgs),
    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone, Debug)]
pub struct DevArgs {
    /// Server base URL, e.g. https://deploy.example.com
    #[arg(long, env = "NIXOPUS_SERVER_URL")]
    pub server: Option<String>,

    #[arg(long, env = "NIXOPUS_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Application id to sync into
    #[arg(long)]
    pub app: String,

    #[arg(long, env = "NIXOPUS_ORGANIZATION_ID")]
    pub org: Option<String>,

    /// Directory to watch
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Extra glob patterns to skip (repeatable)
    #[arg(long = "exclude")]
    pub excludes: Vec<String>,

    #[arg(long)]
    pub debounce_ms: Option<u64>,

    /// Give up after this many reconnect attempts (0 retries forever)
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum DbCommands {
    /// Create the database and apply the schema
    Init {
        /// Database path (overrides storage.db_path)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum ConfigCommands {
    /// Print the resolved configuration
    Show,
    /// Validate the resolved configuration
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = NixopusToml::resolve(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    logging::init(&config.logging.level, config.logging.format)?;

    match cli.command {
        Commands::Serve { host, port } => cmd::cmd_serve(config, host, port).await?,
        Commands::Dev(args) => cmd::cmd_dev(&config, args).await?,
        Commands::Db { command } => cmd::cmd_db(&config, command)?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }

    Ok(())
}
