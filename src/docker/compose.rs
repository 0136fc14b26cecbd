use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

use crate::deploy::models::EnvMap;

pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeAction {
    Build { no_cache: bool },
    Up,
    Down,
}

/// Arguments after `docker` for one compose invocation.
pub fn compose_args(compose_file: &Path, action: ComposeAction) -> Vec<String> {
    let mut args = vec![
        "compose".to_string(),
        "-f".to_string(),
        compose_file.display().to_string(),
    ];
    match action {
        ComposeAction::Build { no_cache } => {
            args.push("build".into());
            if no_cache {
                args.push("--no-cache".into());
            }
        }
        ComposeAction::Up => {
            args.extend(["up", "-d", "--remove-orphans"].map(String::from));
        }
        ComposeAction::Down => {
            args.extend(["down", "--remove-orphans"].map(String::from));
        }
    }
    args
}

/// Run `docker compose` next to the compose file and return its output.
/// Non-zero exit is an error carrying the output.
pub async fn run_compose(
    docker_host: Option<&str>,
    compose_file: &Path,
    env: &EnvMap,
    action: ComposeAction,
) -> Result<String> {
    let args = compose_args(compose_file, action);
    let mut cmd = Command::new("docker");
    cmd.args(&args)
        .envs(env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = compose_file.parent() {
        cmd.current_dir(dir);
    }
    if let Some(host) = docker_host {
        cmd.env("DOCKER_HOST", host);
    }
    debug!("docker {}", args.join(" "));
    let output = cmd
        .output()
        .await
        .context("Failed to run docker compose")?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        anyhow::bail!(
            "docker {} exited with {}: {}",
            args[3..].join(" "),
            output.status.code().unwrap_or(-1),
            text.trim()
        );
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_args() {
        let file = Path::new("/srv/app/docker-compose.yml");
        assert_eq!(
            compose_args(file, ComposeAction::Build { no_cache: true }),
            vec!["compose", "-f", "/srv/app/docker-compose.yml", "build", "--no-cache"]
        );
        assert_eq!(
            compose_args(file, ComposeAction::Build { no_cache: false }).last().unwrap(),
            "build"
        );
        assert_eq!(
            &compose_args(file, ComposeAction::Up)[3..],
            ["up", "-d", "--remove-orphans"]
        );
        assert_eq!(compose_args(file, ComposeAction::Down)[3], "down");
    }
}
