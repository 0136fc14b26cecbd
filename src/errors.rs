//! Typed error hierarchy for the deployment core.
//!
//! Three top-level enums cover the three subsystems:
//! - `DeployError`: pipeline, queue handler and live-dev failures
//! - `TransportError`: the reconnecting sync channel
//! - `SyncError`: client-side sync engine failures

use thiserror::Error;

/// Errors from the deployment pipeline and the services built on it.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Failed to prepare deployment: {0}")]
    Prepare(#[source] anyhow::Error),

    #[error("Clone failed: {0}")]
    Clone(#[source] anyhow::Error),

    #[error("Build failed: {0}")]
    Build(#[source] anyhow::Error),

    #[error("Run failed: {0}")]
    Run(#[source] anyhow::Error),

    #[error("Proxy reconcile failed: {0}")]
    Proxy(#[source] anyhow::Error),

    #[error("Command `{command}` exited with code {exit_code}: {output}")]
    Command {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("container not running")]
    ContainerNotRunning,

    #[error("Live-dev service did not become ready within {timeout_secs}s")]
    ReadinessTimeout { timeout_secs: u64 },

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeployError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Errors from the sync transport client.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,

    /// The socket went away while a send was in flight. Callers park the
    /// message and retry after the next reconnect.
    #[error("Client closed while sending")]
    ClientClosed,

    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Frame codec error: {0}")]
    Codec(#[from] nixopus_common::ProtocolError),
}

/// Errors from the client-side sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Initial sync failed for {failed} of {total} files: {first}")]
    InitialSync {
        failed: usize,
        total: usize,
        first: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_error_not_found_carries_kind_and_id() {
        let err = DeployError::not_found("Application", "abc");
        match &err {
            DeployError::NotFound { kind, id } => {
                assert_eq!(*kind, "Application");
                assert_eq!(id, "abc");
            }
            _ => panic!("Expected NotFound variant"),
        }
        assert_eq!(err.to_string(), "Application abc not found");
    }

    #[test]
    fn deploy_error_container_not_running_message() {
        assert_eq!(
            DeployError::ContainerNotRunning.to_string(),
            "container not running"
        );
    }

    #[test]
    fn deploy_error_command_includes_exit_code() {
        let err = DeployError::Command {
            command: "npm run migrate".into(),
            exit_code: 2,
            output: "boom".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("npm run migrate"));
        assert!(msg.contains('2'));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn deploy_error_from_anyhow() {
        let err: DeployError = anyhow::anyhow!("something odd").into();
        assert!(matches!(err, DeployError::Other(_)));
    }

    #[test]
    fn sync_error_wraps_transport() {
        let err: SyncError = TransportError::Closed.into();
        match err {
            SyncError::Transport(TransportError::Closed) => {}
            other => panic!("Expected Transport(Closed), got {other:?}"),
        }
    }

    #[test]
    fn sync_error_initial_sync_preserves_first_cause() {
        let err = SyncError::InitialSync {
            failed: 2,
            total: 10,
            first: "a.txt: permission denied".into(),
        };
        assert!(err.to_string().contains("a.txt: permission denied"));
    }
}
