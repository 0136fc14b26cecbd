//! Shell command execution on the managed host.
//!
//! [`SshRunner`] drives the system `ssh` client; [`LocalRunner`] runs the
//! command through `sh -c` on this machine (single-host installs and tests).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::config::SshSection;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Combined stdout+stderr of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_command(&self, command: &str) -> Result<CommandOutput>;

    /// Open a session for several commands over one connection.
    async fn connect(&self) -> Result<Box<dyn CommandSession>>;

    /// Host name that routes and published ports refer to.
    fn host(&self) -> &str;
}

#[async_trait]
pub trait CommandSession: Send {
    async fn run(&mut self, command: &str) -> Result<CommandOutput>;
    async fn close(self: Box<Self>) -> Result<()>;
}

async fn run_process(mut cmd: Command, label: &str, limit: Duration) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", label))?;
    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.with_context(|| format!("Failed to wait for {}", label))?,
        Err(_) => anyhow::bail!("{} timed out after {}s", label, limit.as_secs()),
    };
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(CommandOutput {
        output: combined,
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Expand a leading `~/` against the current user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

// ── ssh ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SshRunner {
    host: String,
    user: String,
    port: u16,
    identity_file: Option<PathBuf>,
    timeout: Duration,
}

impl SshRunner {
    pub fn new(section: &SshSection) -> Self {
        Self {
            host: section.host.clone(),
            user: section.user.clone(),
            port: section.port,
            identity_file: section.identity_file.as_deref().map(expand_home),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Arguments shared by every invocation, before the destination.
    pub fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ConnectTimeout=15".to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    fn command(&self, control_path: Option<&PathBuf>, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args());
        if let Some(path) = control_path {
            cmd.arg("-S").arg(path);
        }
        cmd.arg(self.destination()).arg("--").arg(remote);
        cmd
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        debug!(host = %self.host, "ssh: {}", command);
        run_process(self.command(None, command), "ssh command", self.timeout).await
    }

    async fn connect(&self) -> Result<Box<dyn CommandSession>> {
        let control_path = std::env::temp_dir().join(format!("nixopus-ssh-{}", Uuid::new_v4()));
        let mut master = Command::new("ssh");
        master
            .args(self.base_args())
            .args(["-M", "-N", "-f", "-o", "ControlPersist=yes", "-S"])
            .arg(&control_path)
            .arg(self.destination());
        let out = run_process(master, "ssh control master", Duration::from_secs(30)).await?;
        if !out.success() {
            anyhow::bail!(
                "Failed to open ssh session to {}: {}",
                self.host,
                out.output.trim()
            );
        }
        Ok(Box::new(SshSession {
            runner: self.clone(),
            control_path,
        }))
    }

    fn host(&self) -> &str {
        &self.host
    }
}

struct SshSession {
    runner: SshRunner,
    control_path: PathBuf,
}

#[async_trait]
impl CommandSession for SshSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutput> {
        let cmd = self.runner.command(Some(&self.control_path), command);
        run_process(cmd, "ssh command", self.runner.timeout).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(self.runner.destination());
        run_process(cmd, "ssh control exit", Duration::from_secs(10)).await?;
        Ok(())
    }
}

// ── local ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocalRunner {
    host: String,
    timeout: Duration,
}

impl LocalRunner {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        run_process(Self::command(command), "shell command", self.timeout).await
    }

    async fn connect(&self) -> Result<Box<dyn CommandSession>> {
        Ok(Box::new(LocalSession {
            timeout: self.timeout,
        }))
    }

    fn host(&self) -> &str {
        &self.host
    }
}

struct LocalSession {
    timeout: Duration,
}

#[async_trait]
impl CommandSession for LocalSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutput> {
        run_process(LocalRunner::command(command), "shell command", self.timeout).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Build the runner described by `[ssh]`.
pub fn runner_from_config(section: &SshSection) -> std::sync::Arc<dyn CommandRunner> {
    if section.local {
        std::sync::Arc::new(LocalRunner::new(section.host.clone()))
    } else {
        std::sync::Arc::new(SshRunner::new(section))
    }
}
