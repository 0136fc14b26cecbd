//! Receiving half of the sync protocol.
//!
//! One [`IngestSession`] per client connection. Files are assembled from
//! their `file_content` chunks in memory and land in the application's
//! staging directory through a temp file and a rename, so the dev server
//! never reads a half-written file.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use nixopus_common::{
    AckPayload, ErrorPayload, FileChangePayload, FileContentPayload, FileOperation, Payload,
    SyncMessage, SyncPhase, checksum, normalize_relative_path,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct PendingFile {
    checksum: String,
    total_chunks: u32,
    next_chunk: u32,
    data: Vec<u8>,
}

pub struct IngestSession {
    root: PathBuf,
    pending: HashMap<String, PendingFile>,
    written: u64,
    deleted: u64,
}

/// Map a client path onto `root`. Rejects absolute paths and traversal.
pub fn resolve_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.starts_with('/') || relative.starts_with('\\') {
        bail!("absolute path '{}' is not allowed", relative);
    }
    let normalized = normalize_relative_path(relative);
    if normalized.is_empty() {
        bail!("empty path");
    }
    let path = Path::new(&normalized);
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("path '{}' escapes the staging directory", relative);
    }
    Ok(root.join(path))
}

impl IngestSession {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pending: HashMap::new(),
            written: 0,
            deleted: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files_written(&self) -> u64 {
        self.written
    }

    /// Apply one frame and return the replies to send back.
    pub async fn handle(&mut self, message: SyncMessage) -> Vec<SyncMessage> {
        match message.payload {
            Payload::Ping => vec![SyncMessage::pong()],
            Payload::FileChange(change) => self.on_change(change).await.into_iter().collect(),
            Payload::FileContent(content) => self.on_content(content).await.into_iter().collect(),
            Payload::FileDelete(delete) => vec![self.on_delete(&delete.path).await],
            Payload::Sync(sync) => {
                match sync.phase {
                    SyncPhase::Start => info!(root = %self.root.display(), total = sync.total_files, "initial sync started"),
                    SyncPhase::Complete => info!(
                        root = %self.root.display(),
                        written = self.written,
                        deleted = self.deleted,
                        "initial sync complete"
                    ),
                }
                Vec::new()
            }
            Payload::Ack(_) | Payload::Error(_) | Payload::Pong => Vec::new(),
        }
    }

    async fn on_change(&mut self, change: FileChangePayload) -> Option<SyncMessage> {
        if change.operation == FileOperation::Delete {
            return Some(self.on_delete(&change.path).await);
        }
        if let Err(e) = resolve_path(&self.root, &change.path) {
            return Some(error_reply(&change.path, &e));
        }
        let key = normalize_relative_path(&change.path);
        self.pending.insert(
            key,
            PendingFile {
                checksum: change.checksum,
                total_chunks: 0,
                next_chunk: 0,
                data: Vec::with_capacity(change.size.min(64 * 1024 * 1024) as usize),
            },
        );
        None
    }

    async fn on_content(&mut self, content: FileContentPayload) -> Option<SyncMessage> {
        let target = match resolve_path(&self.root, &content.path) {
            Ok(target) => target,
            Err(e) => return Some(error_reply(&content.path, &e)),
        };
        let key = normalize_relative_path(&content.path);
        let pending = self.pending.entry(key.clone()).or_insert_with(|| PendingFile {
            checksum: content.checksum.clone(),
            total_chunks: 0,
            next_chunk: 0,
            data: Vec::new(),
        });
        if pending.checksum != content.checksum {
            // A newer version superseded the one being assembled.
            *pending = PendingFile {
                checksum: content.checksum.clone(),
                total_chunks: 0,
                next_chunk: 0,
                data: Vec::new(),
            };
        }
        if content.chunk_index != pending.next_chunk {
            let expected = pending.next_chunk;
            self.pending.remove(&key);
            return Some(error_reply(
                &content.path,
                &anyhow::anyhow!("expected chunk {} but got {}", expected, content.chunk_index),
            ));
        }
        pending.total_chunks = content.total_chunks.max(1);
        pending.next_chunk += 1;
        pending.data.extend_from_slice(&content.data);
        if pending.next_chunk < pending.total_chunks {
            return None;
        }

        let file = self.pending.remove(&key)?;
        let actual = checksum(&file.data);
        if actual != file.checksum {
            return Some(error_reply(
                &content.path,
                &anyhow::anyhow!("checksum mismatch (expected {}, got {})", file.checksum, actual),
            ));
        }
        match write_atomic(&target, &file.data).await {
            Ok(()) => {
                self.written += 1;
                debug!(path = %key, bytes = file.data.len(), "file synced");
                Some(SyncMessage::new(Payload::Ack(AckPayload {
                    path: key,
                    checksum: Some(file.checksum),
                })))
            }
            Err(e) => {
                warn!(path = %key, "failed to write synced file: {e:#}");
                Some(error_reply(&content.path, &e))
            }
        }
    }

    async fn on_delete(&mut self, path: &str) -> SyncMessage {
        let target = match resolve_path(&self.root, path) {
            Ok(target) => target,
            Err(e) => return error_reply(path, &e),
        };
        let key = normalize_relative_path(path);
        self.pending.remove(&key);
        match remove_path(&target).await {
            Ok(()) => {
                self.deleted += 1;
                debug!(path = %key, "file deleted");
                SyncMessage::new(Payload::Ack(AckPayload {
                    path: key,
                    checksum: None,
                }))
            }
            Err(e) => error_reply(path, &e),
        }
    }
}

fn error_reply(path: &str, err: &anyhow::Error) -> SyncMessage {
    SyncMessage::new(Payload::Error(ErrorPayload {
        path: Some(path.to_string()),
        message: format!("{err:#}"),
    }))
}

async fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("{} has no parent directory", target.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create {}", parent.display()))?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("Failed to move file into {}", target.display()));
    }
    Ok(())
}

async fn remove_path(target: &Path) -> Result<()> {
    let meta = match tokio::fs::symlink_metadata(target).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", target.display())),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(target).await
    } else {
        tokio::fs::remove_file(target).await
    }
    .with_context(|| format!("Failed to delete {}", target.display()))
}
