use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
/// Logs go to stderr so stdout stays free for command output.
pub fn init(level: &str, format: LogFormat) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let base = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env)
            .with(base.json())
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env)
            .with(base.compact())
            .try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
