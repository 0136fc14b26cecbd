//! Client half of the live-dev sync: initial walk, incremental changes,
//! and the pending list that survives disconnects.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nixopus_common::{
    CHUNK_SIZE, FileChangePayload, FileContentPayload, FileDeletePayload, FileOperation, Payload,
    SyncMessage, SyncPayload, SyncPhase, checksum, chunk_count, normalize_relative_path,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::ignore::IgnoreRules;
use super::transport::ConnectionState;
use super::watcher::{ChangeKind, FileEvent};
use crate::errors::{SyncError, TransportError};

/// Up to this many files are sent one after another.
pub const SEQUENTIAL_LIMIT: usize = 100;
pub const SYNC_WORKERS: usize = 10;
pub const JOB_QUEUE_DEPTH: usize = 20;

/// Where framed messages go. Implemented by the transport.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, message: SyncMessage) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
}

pub type PathCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SyncCallbacks {
    pub on_file_synced: Option<PathCallback>,
    pub on_change_detected: Option<PathCallback>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingChange {
    path: String,
    kind: ChangeKind,
}

pub struct SyncEngine {
    root: PathBuf,
    rules: Arc<IgnoreRules>,
    sink: Arc<dyn MessageSink>,
    callbacks: SyncCallbacks,
    checksums: Mutex<HashMap<String, String>>,
    pending: Mutex<Vec<PendingChange>>,
}

impl SyncEngine {
    pub fn new(rules: Arc<IgnoreRules>, sink: Arc<dyn MessageSink>, callbacks: SyncCallbacks) -> Self {
        Self {
            root: rules.root().to_path_buf(),
            rules,
            sink,
            callbacks,
            checksums: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Last checksum sent for `path`, relative to the root.
    pub fn last_checksum(&self, path: &str) -> Option<String> {
        self.checksums.lock().ok()?.get(path).cloned()
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let rel = normalize_relative_path(&rel.to_string_lossy());
        (!rel.is_empty()).then_some(rel)
    }

    /// Every file under the root that survives the exclusion rules.
    pub async fn collect_files(&self) -> Result<Vec<PathBuf>, SyncError> {
        let mut candidates = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.path() == self.root || !self.rules.is_excluded(e.path()));
        for entry in walker {
            let entry = entry.map_err(|e| SyncError::Io {
                path: e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone()),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk failed")),
            })?;
            if entry.file_type().is_file() {
                candidates.push(entry.into_path());
            }
        }
        let mut files = Vec::with_capacity(candidates.len());
        for path in candidates {
            if !self.rules.git_check_ignore(&path).await {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Send every file once. Fails unless every file was sent.
    pub async fn initial_sync(self: &Arc<Self>) -> Result<usize, SyncError> {
        let files = self.collect_files().await?;
        let total = files.len();
        if total == 0 {
            info!(root = %self.root.display(), "nothing to sync");
            return Ok(0);
        }
        info!(total, root = %self.root.display(), "initial sync starting");
        self.sink
            .send(SyncMessage::new(Payload::Sync(SyncPayload {
                phase: SyncPhase::Start,
                total_files: total as u64,
            })))
            .await?;

        let (sent, failed, first) = if total <= SEQUENTIAL_LIMIT {
            let mut sent = 0;
            let mut failed = 0;
            let mut first: Option<String> = None;
            for path in files {
                match self.sync_initial_file(&path).await {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        failed += 1;
                        first.get_or_insert_with(|| format!("{}: {e}", path.display()));
                    }
                }
            }
            (sent, failed, first)
        } else {
            self.parallel_initial_sync(files).await
        };

        if failed > 0 || sent != total {
            return Err(SyncError::InitialSync {
                failed: total - sent,
                total,
                first: first.unwrap_or_else(|| "files were not processed".to_string()),
            });
        }
        self.sink
            .send(SyncMessage::new(Payload::Sync(SyncPayload {
                phase: SyncPhase::Complete,
                total_files: total as u64,
            })))
            .await?;
        info!(total, "initial sync complete");
        Ok(total)
    }

    async fn parallel_initial_sync(self: &Arc<Self>, files: Vec<PathBuf>) -> (usize, usize, Option<String>) {
        let (job_tx, job_rx) = mpsc::channel::<PathBuf>(JOB_QUEUE_DEPTH);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Result<(), String>>();

        let mut workers = Vec::with_capacity(SYNC_WORKERS);
        for _ in 0..SYNC_WORKERS {
            let engine = Arc::clone(self);
            let jobs = Arc::clone(&job_rx);
            let results = result_tx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = jobs.lock().await.recv().await;
                    let Some(path) = next else { break };
                    let outcome = engine
                        .sync_initial_file(&path)
                        .await
                        .map_err(|e| format!("{}: {e}", path.display()));
                    if results.send(outcome).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        for path in files {
            if job_tx.send(path).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let mut sent = 0;
        let mut failed = 0;
        let mut first = None;
        while let Some(outcome) = result_rx.recv().await {
            match outcome {
                Ok(()) => sent += 1,
                Err(e) => {
                    failed += 1;
                    first.get_or_insert(e);
                }
            }
        }
        for worker in workers {
            if let Err(e) = worker.await {
                failed += 1;
                first.get_or_insert_with(|| format!("sync worker panicked: {e}"));
            }
        }
        (sent, failed, first)
    }

    async fn sync_initial_file(&self, path: &Path) -> Result<(), SyncError> {
        let Some(rel) = self.relative(path) else {
            return Ok(());
        };
        let (data, mod_time) = read_file(path).await?;
        let sum = checksum(&data);
        if let Ok(mut checksums) = self.checksums.lock() {
            checksums.insert(rel.clone(), sum.clone());
        }
        self.send_content(&rel, FileOperation::Create, &data, sum, mod_time)
            .await?;
        self.synced(&rel);
        Ok(())
    }

    /// Frame one file: a change header followed by its content chunks.
    async fn send_content(
        &self,
        rel: &str,
        operation: FileOperation,
        data: &[u8],
        sum: String,
        mod_time: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        self.sink
            .send(SyncMessage::new(Payload::FileChange(FileChangePayload {
                path: rel.to_string(),
                operation,
                size: data.len() as u64,
                checksum: sum.clone(),
                mod_time,
            })))
            .await?;
        let total_chunks = chunk_count(data.len());
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(CHUNK_SIZE).collect()
        };
        for (index, chunk) in chunks.into_iter().enumerate() {
            self.sink
                .send(SyncMessage::new(Payload::FileContent(FileContentPayload {
                    path: rel.to_string(),
                    chunk_index: index as u32,
                    total_chunks,
                    data: chunk.to_vec(),
                    checksum: sum.clone(),
                })))
                .await?;
        }
        Ok(())
    }

    async fn send_delete(&self, rel: &str) -> Result<(), TransportError> {
        self.sink
            .send(SyncMessage::new(Payload::FileDelete(FileDeletePayload::new(rel))))
            .await
    }

    fn synced(&self, rel: &str) {
        if let Some(cb) = &self.callbacks.on_file_synced {
            cb(rel);
        }
    }

    fn park(&self, change: PendingChange) {
        debug!(path = %change.path, "parking change until reconnect");
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(change);
        }
    }

    /// Apply one watcher event.
    pub async fn handle_event(&self, event: FileEvent) -> Result<(), SyncError> {
        if self.rules.is_excluded(&event.path) {
            return Ok(());
        }
        let Some(rel) = self.relative(&event.path) else {
            return Ok(());
        };

        let kind = match tokio::fs::metadata(&event.path).await {
            Ok(meta) if meta.is_dir() => return Ok(()),
            Ok(_) if event.kind == ChangeKind::Create => ChangeKind::Create,
            Ok(_) => ChangeKind::Modify,
            Err(_) => ChangeKind::Delete,
        };

        if kind == ChangeKind::Delete {
            let known = self
                .checksums
                .lock()
                .map(|mut c| c.remove(&rel).is_some())
                .unwrap_or(false);
            debug!(path = %rel, known, "delete detected");
            self.changed(&rel);
            return self.dispatch(PendingChange { path: rel, kind }).await;
        }

        let (data, mod_time) = match read_file(&event.path).await {
            Ok(read) => read,
            // Gone between stat and read; the delete event follows.
            Err(SyncError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let sum = checksum(&data);
        {
            let Ok(mut checksums) = self.checksums.lock() else {
                return Ok(());
            };
            if checksums.get(&rel) == Some(&sum) {
                return Ok(());
            }
            checksums.insert(rel.clone(), sum.clone());
        }
        self.changed(&rel);

        if !self.sink.is_connected() {
            self.park(PendingChange { path: rel, kind });
            return Ok(());
        }
        match self
            .send_content(&rel, operation_of(kind), &data, sum, mod_time)
            .await
        {
            Ok(()) => {
                self.synced(&rel);
                Ok(())
            }
            Err(TransportError::ClientClosed) => {
                self.park(PendingChange { path: rel, kind });
                Ok(())
            }
            Err(e) => {
                if let Ok(mut checksums) = self.checksums.lock() {
                    checksums.remove(&rel);
                }
                Err(e.into())
            }
        }
    }

    fn changed(&self, rel: &str) {
        if let Some(cb) = &self.callbacks.on_change_detected {
            cb(rel);
        }
    }

    async fn dispatch(&self, change: PendingChange) -> Result<(), SyncError> {
        if !self.sink.is_connected() {
            self.park(change);
            return Ok(());
        }
        match self.send_change(&change).await {
            Ok(()) => Ok(()),
            Err(SyncError::Transport(TransportError::ClientClosed)) => {
                self.park(change);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Send a parked change using the file's current content.
    async fn send_change(&self, change: &PendingChange) -> Result<(), SyncError> {
        if change.kind == ChangeKind::Delete {
            self.send_delete(&change.path).await?;
            return Ok(());
        }
        let path = self.root.join(&change.path);
        match read_file(&path).await {
            Ok((data, mod_time)) => {
                let sum = checksum(&data);
                if let Ok(mut checksums) = self.checksums.lock() {
                    checksums.insert(change.path.clone(), sum.clone());
                }
                self.send_content(&change.path, operation_of(change.kind), &data, sum, mod_time)
                    .await?;
                self.synced(&change.path);
            }
            Err(SyncError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                if let Ok(mut checksums) = self.checksums.lock() {
                    checksums.remove(&change.path);
                }
                self.send_delete(&change.path).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Re-send everything parked while disconnected, once per path.
    pub async fn flush_pending(&self) -> usize {
        let drained = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return 0,
        };
        if drained.is_empty() {
            return 0;
        }
        let mut latest: HashMap<String, usize> = HashMap::new();
        for (index, change) in drained.iter().enumerate() {
            latest.insert(change.path.clone(), index);
        }
        let mut sent = 0;
        for (index, change) in drained.into_iter().enumerate() {
            if latest.get(&change.path) != Some(&index) {
                continue;
            }
            match self.send_change(&change).await {
                Ok(()) => sent += 1,
                Err(SyncError::Transport(TransportError::ClientClosed)) => self.park(change),
                Err(e) => warn!(path = %change.path, "pending change dropped: {e}"),
            }
        }
        info!(sent, "flushed pending changes");
        sent
    }

    /// Process watcher events until the stream ends, flushing parked
    /// changes whenever the connection comes back.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<FileEvent>,
        mut states: watch::Receiver<ConnectionState>,
    ) {
        let mut last = *states.borrow();
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let path = event.path.clone();
                    if let Err(e) = self.handle_event(event).await {
                        warn!(path = %path.display(), "sync failed: {e}");
                    }
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    if state == ConnectionState::Connected && last != ConnectionState::Connected {
                        self.flush_pending().await;
                    }
                    if state == ConnectionState::Closed {
                        break;
                    }
                    last = state;
                }
            }
        }
    }
}

fn operation_of(kind: ChangeKind) -> FileOperation {
    match kind {
        ChangeKind::Create => FileOperation::Create,
        ChangeKind::Modify => FileOperation::Modify,
        ChangeKind::Delete => FileOperation::Delete,
    }
}

async fn read_file(path: &Path) -> Result<(Vec<u8>, DateTime<Utc>), SyncError> {
    let io = |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    };
    let data = tokio::fs::read(path).await.map_err(io)?;
    let mod_time = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok((data, mod_time))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sent: Mutex<Vec<SyncMessage>>,
        pub offline: AtomicBool,
        /// Fail this many sends with `ClientClosed` before succeeding.
        pub fail_closed: AtomicUsize,
    }

    impl RecordingSink {
        pub(crate) fn messages(&self) -> Vec<SyncMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn changes(&self) -> Vec<(String, FileOperation)> {
            self.messages()
                .into_iter()
                .filter_map(|m| match m.payload {
                    Payload::FileChange(c) => Some((c.path, c.operation)),
                    Payload::FileDelete(d) => Some((d.path, FileOperation::Delete)),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send(&self, message: SyncMessage) -> Result<(), TransportError> {
            if self
                .fail_closed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::ClientClosed);
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }
    }

    fn engine(root: &Path, sink: Arc<RecordingSink>) -> Arc<SyncEngine> {
        let rules = Arc::new(IgnoreRules::new(root, &["*.log".to_string()]).unwrap());
        Arc::new(SyncEngine::new(rules, sink, SyncCallbacks::default()))
    }

    #[tokio::test]
    async fn test_initial_sync_small_tree() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/x")).unwrap();
        std::fs::write(dir.path().join("src/index.ts"), "export {}").unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::write(dir.path().join("empty.txt"), "").unwrap();
        std::fs::write(dir.path().join("debug.log"), "noise").unwrap();
        std::fs::write(dir.path().join("node_modules/x/i.js"), "x").unwrap();

        let sink = Arc::new(RecordingSink::default());
        let synced = Arc::new(Mutex::new(Vec::new()));
        let record = synced.clone();
        let rules = Arc::new(IgnoreRules::new(dir.path(), &["*.log".to_string()]).unwrap());
        let engine = Arc::new(SyncEngine::new(
            rules,
            sink.clone(),
            SyncCallbacks {
                on_file_synced: Some(Arc::new(move |p: &str| record.lock().unwrap().push(p.to_string()))),
                on_change_detected: None,
            },
        ));

        assert_eq!(engine.initial_sync().await.unwrap(), 3);
        let messages = sink.messages();
        assert!(matches!(
            messages.first().map(|m| &m.payload),
            Some(Payload::Sync(SyncPayload { phase: SyncPhase::Start, total_files: 3 }))
        ));
        assert!(matches!(
            messages.last().map(|m| &m.payload),
            Some(Payload::Sync(SyncPayload { phase: SyncPhase::Complete, .. }))
        ));
        let mut paths: Vec<String> = sink.changes().into_iter().map(|(p, _)| p).collect();
        paths.sort();
        assert_eq!(paths, vec!["empty.txt", "package.json", "src/index.ts"]);
        assert_eq!(synced.lock().unwrap().len(), 3);

        let empty_chunks: Vec<_> = messages
            .iter()
            .filter_map(|m| match &m.payload {
                Payload::FileContent(c) if c.path == "empty.txt" => Some(c.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(empty_chunks.len(), 1);
        assert_eq!(empty_chunks[0].total_chunks, 1);
        assert!(empty_chunks[0].data.is_empty());
    }

    #[tokio::test]
    async fn test_initial_sync_of_empty_tree_sends_nothing() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/x")).unwrap();
        std::fs::write(dir.path().join("node_modules/x/i.js"), "x").unwrap();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(dir.path(), sink.clone());
        assert_eq!(engine.initial_sync().await.unwrap(), 0);
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_initial_sync_parallel_processes_every_file() {
        let dir = tempdir().unwrap();
        for i in 0..150 {
            std::fs::write(dir.path().join(format!("f{i:03}.txt")), format!("file {i}")).unwrap();
        }
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(dir.path(), sink.clone());
        assert_eq!(engine.initial_sync().await.unwrap(), 150);
        assert_eq!(sink.changes().len(), 150);
        assert_eq!(engine.last_checksum("f007.txt"), Some(checksum(b"file 7")));
    }

    #[tokio::test]
    async fn test_initial_sync_reports_failures() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        let sink = Arc::new(RecordingSink::default());
        // Only the start frame gets through.
        let failing = Arc::new(FailAfter {
            inner: sink.clone(),
            allowed: AtomicUsize::new(1),
        });
        let rules = Arc::new(IgnoreRules::new(dir.path(), &[]).unwrap());
        let broken = Arc::new(SyncEngine::new(rules, failing, SyncCallbacks::default()));
        match broken.initial_sync().await {
            Err(SyncError::InitialSync { failed, total, first }) => {
                assert_eq!(total, 2);
                assert_eq!(failed, 2);
                assert!(first.contains("a.txt"));
            }
            other => panic!("Expected InitialSync error, got {other:?}"),
        }
        assert_eq!(sink.messages().len(), 1);
    }

    struct FailAfter {
        inner: Arc<RecordingSink>,
        allowed: AtomicUsize,
    }

    #[async_trait]
    impl MessageSink for FailAfter {
        async fn send(&self, message: SyncMessage) -> Result<(), TransportError> {
            if self
                .allowed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
            {
                return Err(TransportError::Send("broken pipe".into()));
            }
            self.inner.send(message).await
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_large_file_is_chunked() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 10)).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("blob.bin"), &data).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(dir.path(), sink.clone());
        engine
            .handle_event(FileEvent::new(dir.path().join("blob.bin"), ChangeKind::Create))
            .await
            .unwrap();

        let chunks: Vec<FileContentPayload> = sink
            .messages()
            .into_iter()
            .filter_map(|m| match m.payload {
                Payload::FileContent(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.total_chunks == 3 && c.checksum == checksum(&data)));
        assert_eq!(chunks[2].data.len(), 10);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_unchanged_content_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "one").unwrap();
        let sink = Arc::new(RecordingSink::default());
        let detected = Arc::new(AtomicUsize::new(0));
        let count = detected.clone();
        let rules = Arc::new(IgnoreRules::new(dir.path(), &[]).unwrap());
        let engine = SyncEngine::new(
            rules,
            sink.clone(),
            SyncCallbacks {
                on_file_synced: None,
                on_change_detected: Some(Arc::new(move |_: &str| {
                    count.fetch_add(1, Ordering::SeqCst);
                })),
            },
        );

        engine.handle_event(FileEvent::new(&path, ChangeKind::Modify)).await.unwrap();
        engine.handle_event(FileEvent::new(&path, ChangeKind::Modify)).await.unwrap();
        assert_eq!(sink.changes(), vec![("a.txt".to_string(), FileOperation::Modify)]);
        assert_eq!(detected.load(Ordering::SeqCst), 1);

        std::fs::write(&path, "two").unwrap();
        engine.handle_event(FileEvent::new(&path, ChangeKind::Modify)).await.unwrap();
        assert_eq!(sink.changes().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_becomes_delete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        std::fs::write(&path, "x").unwrap();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(dir.path(), sink.clone());
        engine.handle_event(FileEvent::new(&path, ChangeKind::Create)).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        // The watcher may still say modify; the file system decides.
        engine.handle_event(FileEvent::new(&path, ChangeKind::Modify)).await.unwrap();
        assert_eq!(
            sink.changes(),
            vec![
                ("gone.txt".to_string(), FileOperation::Create),
                ("gone.txt".to_string(), FileOperation::Delete),
            ]
        );
        assert_eq!(engine.last_checksum("gone.txt"), None);
    }

    #[tokio::test]
    async fn test_excluded_events_are_ignored() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("app.log"), "x").unwrap();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(dir.path(), sink.clone());
        engine
            .handle_event(FileEvent::new(dir.path().join("app.log"), ChangeKind::Create))
            .await
            .unwrap();
        engine
            .handle_event(FileEvent::new(dir.path().join(".git/index"), ChangeKind::Modify))
            .await
            .unwrap();
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_offline_changes_flush_once_per_path() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "a1").unwrap();
        std::fs::write(&b, "b1").unwrap();
        let sink = Arc::new(RecordingSink::default());
        sink.offline.store(true, Ordering::SeqCst);
        let engine = engine(dir.path(), sink.clone());

        engine.handle_event(FileEvent::new(&a, ChangeKind::Create)).await.unwrap();
        std::fs::write(&a, "a2").unwrap();
        engine.handle_event(FileEvent::new(&a, ChangeKind::Modify)).await.unwrap();
        engine.handle_event(FileEvent::new(&b, ChangeKind::Create)).await.unwrap();
        std::fs::remove_file(&b).unwrap();
        engine.handle_event(FileEvent::new(&b, ChangeKind::Delete)).await.unwrap();
        assert_eq!(engine.pending_len(), 4);
        assert!(sink.messages().is_empty());

        sink.offline.store(false, Ordering::SeqCst);
        assert_eq!(engine.flush_pending().await, 2);
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(
            sink.changes(),
            vec![
                ("a.txt".to_string(), FileOperation::Modify),
                ("b.txt".to_string(), FileOperation::Delete),
            ]
        );
        let content = sink
            .messages()
            .into_iter()
            .find_map(|m| match m.payload {
                Payload::FileContent(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(content.data, b"a2");
    }

    #[tokio::test]
    async fn test_client_closed_send_is_parked() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "a").unwrap();
        let sink = Arc::new(RecordingSink::default());
        sink.fail_closed.store(1, Ordering::SeqCst);
        let engine = engine(dir.path(), sink.clone());

        engine.handle_event(FileEvent::new(&a, ChangeKind::Create)).await.unwrap();
        assert_eq!(engine.pending_len(), 1);
        assert_eq!(engine.flush_pending().await, 1);
        assert_eq!(sink.changes(), vec![("a.txt".to_string(), FileOperation::Create)]);
    }

    #[tokio::test]
    async fn test_run_flushes_on_reconnect() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "a").unwrap();
        let sink = Arc::new(RecordingSink::default());
        sink.offline.store(true, Ordering::SeqCst);
        let engine = engine(dir.path(), sink.clone());

        let (event_tx, event_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Reconnecting);
        let task = tokio::spawn(engine.clone().run(event_rx, state_rx));

        event_tx.send(FileEvent::new(&a, ChangeKind::Create)).await.unwrap();
        for _ in 0..200 {
            if engine.pending_len() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(engine.pending_len(), 1);

        sink.offline.store(false, Ordering::SeqCst);
        state_tx.send(ConnectionState::Connected).unwrap();
        for _ in 0..200 {
            if !sink.changes().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(sink.changes(), vec![("a.txt".to_string(), FileOperation::Create)]);

        state_tx.send(ConnectionState::Closed).unwrap();
        task.await.unwrap();
    }
}
