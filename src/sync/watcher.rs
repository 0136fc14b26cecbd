//! Recursive file watcher with a coalescing debouncer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::ignore::IgnoreRules;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Coalesces events per path within one window. A queued delete wins over
/// anything that follows it.
#[derive(Debug, Default)]
pub struct Debouncer {
    pending: Mutex<HashMap<PathBuf, ChangeKind>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `event`. Returns true when it opened a new window.
    pub fn push(&self, event: FileEvent) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        let opened = pending.is_empty();
        match pending.get(&event.path) {
            Some(ChangeKind::Delete) if event.kind != ChangeKind::Delete => {}
            Some(ChangeKind::Create) if event.kind == ChangeKind::Modify => {}
            _ => {
                pending.insert(event.path, event.kind);
            }
        }
        opened
    }

    /// Hand off the current window and reset.
    pub fn take(&self) -> Vec<FileEvent> {
        let snapshot = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return Vec::new(),
        };
        let mut events: Vec<FileEvent> = snapshot
            .into_iter()
            .map(|(path, kind)| FileEvent { path, kind })
            .collect();
        events.sort_by(|a, b| a.path.cmp(&b.path));
        events
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().map(|p| p.is_empty()).unwrap_or(true)
    }
}

/// Map one raw notify event onto file events. Renames become a delete of
/// the source, the destination is reported as a create.
pub fn classify(event: &Event) -> Vec<FileEvent> {
    let files = |kind: ChangeKind| -> Vec<FileEvent> {
        event
            .paths
            .iter()
            .filter(|p| !p.is_dir())
            .map(|p| FileEvent::new(p.clone(), kind))
            .collect()
    };
    match &event.kind {
        EventKind::Create(_) => files(ChangeKind::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|p| FileEvent::new(p.clone(), ChangeKind::Delete))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => files(ChangeKind::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.push(FileEvent::new(from.clone(), ChangeKind::Delete));
            }
            if let Some(to) = event.paths.get(1).filter(|p| !p.is_dir()) {
                out.push(FileEvent::new(to.clone(), ChangeKind::Create));
            }
            out
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => files(ChangeKind::Modify),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| FileEvent::new(p.clone(), ChangeKind::Delete))
            .collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// A running watch. Dropping it stops the notify backend and the debounce
/// task.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FileWatcher {
    /// Watch `root` recursively. Debounced, filtered events arrive on the
    /// returned receiver until the watcher is dropped.
    pub fn start(
        root: &Path,
        rules: Arc<IgnoreRules>,
        delay: Duration,
    ) -> Result<(Self, mpsc::Receiver<FileEvent>)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            Config::default(),
        )
        .context("Failed to create file watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        let (tx, rx) = mpsc::channel(1024);
        let task = tokio::spawn(debounce(raw_rx, rules, delay, tx));

        Ok((
            Self {
                _watcher: watcher,
                task,
            },
            rx,
        ))
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Filter raw notify events and forward one coalesced event per path for
/// each window. A window opens with the first event and closes `delay`
/// later.
async fn debounce(
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    rules: Arc<IgnoreRules>,
    delay: Duration,
    tx: mpsc::Sender<FileEvent>,
) {
    let debouncer = Debouncer::new();
    let mut deadline: Option<Instant> = None;
    loop {
        let flush_at = deadline;
        tokio::select! {
            raw = raw_rx.recv() => {
                let Some(raw) = raw else { break };
                let event = match raw {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("watch error: {e}");
                        continue;
                    }
                };
                for change in classify(&event) {
                    if rules.is_excluded(&change.path) {
                        continue;
                    }
                    if debouncer.push(change) {
                        deadline = Some(Instant::now() + delay);
                    }
                }
            }
            _ = async {
                match flush_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                deadline = None;
                for event in debouncer.take() {
                    debug!(path = %event.path.display(), kind = ?event.kind, "change");
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
