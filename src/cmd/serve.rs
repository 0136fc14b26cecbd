//! Deployment server command — `nixopus serve`.

use anyhow::{Result, bail};
use nixopus::config::NixopusToml;

pub async fn cmd_serve(mut config: NixopusToml, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let problems = config.validate();
    if !problems.is_empty() {
        bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }
    nixopus::deploy::server::start_server(config).await
}
