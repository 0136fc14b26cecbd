//! Named durable task queues with bounded worker pools.
//!
//! Every enqueue is persisted to `queued_tasks` before it is handed to a
//! worker. A worker marks the row reserved, runs the queue's handler once and
//! deletes the row whatever the outcome, so a failed deployment is never
//! retried automatically. Rows left behind by a crash are re-delivered by
//! [`TaskQueue::recover`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::db::DbHandle;
use super::models::TaskPayload;
use crate::config::QueueSection;
use crate::errors::DeployError;

pub const CREATE_DEPLOYMENT: &str = "create-deployment";
pub const UPDATE_DEPLOYMENT: &str = "update-deployment";
pub const REDEPLOY_DEPLOYMENT: &str = "redeploy-deployment";
pub const ROLLBACK_DEPLOYMENT: &str = "rollback-deployment";
pub const RESTART_DEPLOYMENT: &str = "restart-deployment";
pub const LIVE_DEV: &str = "live-dev";

pub const QUEUE_NAMES: [&str; 6] = [
    CREATE_DEPLOYMENT,
    UPDATE_DEPLOYMENT,
    REDEPLOY_DEPLOYMENT,
    ROLLBACK_DEPLOYMENT,
    RESTART_DEPLOYMENT,
    LIVE_DEV,
];

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, payload: TaskPayload) -> Result<(), DeployError>;
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Reserved rows older than this are re-delivered by `recover`.
    pub reservation_timeout: Duration,
    /// Idle time after which an extra worker above `min_workers` exits.
    pub wait_timeout: Duration,
    pub buffer: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            reservation_timeout: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(5),
            buffer: 100,
        }
    }
}

impl From<&QueueSection> for QueueOptions {
    fn from(section: &QueueSection) -> Self {
        Self {
            min_workers: section.min_workers.max(1),
            max_workers: section.max_workers.max(section.min_workers.max(1)),
            reservation_timeout: Duration::from_secs(section.reservation_timeout_secs),
            wait_timeout: Duration::from_secs(section.wait_timeout_secs),
            buffer: section.buffer.max(1),
        }
    }
}

struct Delivery {
    id: Uuid,
    payload: TaskPayload,
}

struct QueueShared {
    name: String,
    handler: Arc<dyn TaskHandler>,
    rx: Mutex<mpsc::Receiver<Delivery>>,
    workers: AtomicUsize,
    idle: AtomicUsize,
}

struct Registered {
    tx: mpsc::Sender<Delivery>,
    shared: Arc<QueueShared>,
}

pub struct TaskQueue {
    db: DbHandle,
    options: QueueOptions,
    queues: std::sync::RwLock<HashMap<String, Registered>>,
    workers: std::sync::Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
}

impl TaskQueue {
    pub fn new(db: DbHandle, options: QueueOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            db,
            options,
            queues: std::sync::RwLock::new(HashMap::new()),
            workers: std::sync::Mutex::new(JoinSet::new()),
            shutdown,
        }
    }

    /// Register the single handler of `name` and start its base workers.
    pub fn register(&self, name: &str, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.options.buffer);
        let shared = Arc::new(QueueShared {
            name: name.to_string(),
            handler,
            rx: Mutex::new(rx),
            workers: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
        });
        {
            let mut queues = self
                .queues
                .write()
                .map_err(|_| anyhow::anyhow!("queue registry lock poisoned"))?;
            if queues.contains_key(name) {
                anyhow::bail!("Queue '{}' already has a handler", name);
            }
            queues.insert(
                name.to_string(),
                Registered {
                    tx,
                    shared: shared.clone(),
                },
            );
        }
        for _ in 0..self.options.min_workers {
            shared.workers.fetch_add(1, Ordering::SeqCst);
            self.spawn_worker(shared.clone(), false)?;
        }
        debug!(queue = name, workers = self.options.min_workers, "queue registered");
        Ok(())
    }

    fn spawn_worker(&self, shared: Arc<QueueShared>, elastic: bool) -> Result<()> {
        let db = self.db.clone();
        let wait_timeout = self.options.wait_timeout;
        let shutdown = self.shutdown.subscribe();
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| anyhow::anyhow!("worker set lock poisoned"))?;
        workers.spawn(worker_loop(shared, db, wait_timeout, shutdown, elastic));
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<(mpsc::Sender<Delivery>, Arc<QueueShared>)> {
        let queues = self
            .queues
            .read()
            .map_err(|_| anyhow::anyhow!("queue registry lock poisoned"))?;
        let registered = queues
            .get(name)
            .with_context(|| format!("No handler registered for queue '{}'", name))?;
        Ok((registered.tx.clone(), registered.shared.clone()))
    }

    /// Persist and dispatch a task. Waits while the queue buffer is full.
    pub async fn enqueue(&self, name: &str, payload: TaskPayload) -> Result<Uuid> {
        let (tx, shared) = self.lookup(name)?;
        let id = Uuid::new_v4();
        let json = serde_json::to_string(&payload).context("Failed to serialize task payload")?;
        let queue = name.to_string();
        self.db
            .call(move |db| db.enqueue_task(id, &queue, &json))
            .await?;
        tx.send(Delivery { id, payload })
            .await
            .map_err(|_| anyhow::anyhow!("Queue '{}' is shut down", name))?;
        self.maybe_scale(&shared)?;
        debug!(queue = name, task_id = %id, "task enqueued");
        Ok(id)
    }

    /// Add one elastic worker when none is idle and the pool has room.
    fn maybe_scale(&self, shared: &Arc<QueueShared>) -> Result<()> {
        if shared.idle.load(Ordering::SeqCst) > 0 {
            return Ok(());
        }
        let max = self.options.max_workers;
        let grew = shared
            .workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok();
        if grew {
            self.spawn_worker(shared.clone(), true)?;
        }
        Ok(())
    }

    /// Re-deliver persisted tasks that never ran or whose reservation
    /// expired. Returns how many were re-queued.
    pub async fn recover(&self) -> Result<usize> {
        let names: Vec<String> = {
            let queues = self
                .queues
                .read()
                .map_err(|_| anyhow::anyhow!("queue registry lock poisoned"))?;
            queues.keys().cloned().collect()
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.options.reservation_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(10));
        let mut recovered = 0;
        for name in names {
            let queue = name.clone();
            let rows = self
                .db
                .call(move |db| db.recoverable_tasks(&queue, cutoff))
                .await?;
            let (tx, shared) = self.lookup(&name)?;
            for row in rows {
                match serde_json::from_str::<TaskPayload>(&row.payload) {
                    Ok(payload) => {
                        tx.send(Delivery {
                            id: row.id,
                            payload,
                        })
                        .await
                        .map_err(|_| anyhow::anyhow!("Queue '{}' is shut down", name))?;
                        self.maybe_scale(&shared)?;
                        recovered += 1;
                    }
                    Err(e) => {
                        warn!(queue = %name, task_id = %row.id, "dropping unreadable task: {e}");
                        let id = row.id;
                        self.db.call(move |db| db.complete_task(id)).await?;
                    }
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "re-delivered persisted tasks");
        }
        Ok(recovered)
    }

    /// Stop taking work and wait up to `grace` for in-flight handlers.
    /// Handlers still running after that are aborted; their rows stay
    /// reserved and are picked up by `recover` on the next start.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.send_replace(true);
        let mut set = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        let drained = tokio::time::timeout(grace, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("aborting task workers still running after {:?}", grace);
            set.shutdown().await;
        }
    }
}

async fn worker_loop(
    shared: Arc<QueueShared>,
    db: DbHandle,
    wait_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
    elastic: bool,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let recv = async { shared.rx.lock().await.recv().await };
        let next = tokio::select! {
            _ = shutdown.changed() => None,
            delivery = async {
                if elastic {
                    tokio::time::timeout(wait_timeout, recv).await.ok().flatten()
                } else {
                    recv.await
                }
            } => delivery,
        };
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        let Some(delivery) = next else {
            break;
        };
        run_delivery(&shared, &db, delivery).await;
    }
    shared.workers.fetch_sub(1, Ordering::SeqCst);
    debug!(queue = %shared.name, elastic, "queue worker exiting");
}

async fn run_delivery(shared: &QueueShared, db: &DbHandle, delivery: Delivery) {
    let id = delivery.id;
    if let Err(e) = db.call(move |db| db.reserve_task(id)).await {
        error!(queue = %shared.name, task_id = %id, "failed to reserve task: {e:#}");
    }
    let correlation_id = delivery.payload.correlation_id;
    let deployment_id = delivery.payload.deployment.id;
    info!(
        queue = %shared.name,
        task_id = %id,
        %correlation_id,
        %deployment_id,
        "task started"
    );
    match shared.handler.handle(delivery.payload).await {
        Ok(()) => info!(queue = %shared.name, task_id = %id, %correlation_id, "task completed"),
        Err(e) => {
            error!(queue = %shared.name, task_id = %id, %correlation_id, "task failed: {e}")
        }
    }
    if let Err(e) = db.call(move |db| db.complete_task(id)).await {
        error!(queue = %shared.name, task_id = %id, "failed to clear task row: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::db::DeployDb;
    use crate::deploy::db::tests::sample_app;
    use crate::deploy::models::{ApplicationDeployment, DeploymentStatus, Status, UpdateOptions};
    use std::sync::atomic::AtomicUsize;

    fn payload() -> TaskPayload {
        let app = sample_app("queued");
        let deployment = ApplicationDeployment::new(app.id, "");
        let status = DeploymentStatus::new(deployment.id, Status::Started);
        TaskPayload {
            correlation_id: Uuid::new_v4(),
            application: app,
            deployment,
            status,
            update_options: UpdateOptions::default(),
            live_dev: None,
        }
    }

    struct Recording {
        seen: mpsc::UnboundedSender<Uuid>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Recording {
        async fn handle(&self, payload: TaskPayload) -> Result<(), DeployError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.seen.send(payload.correlation_id);
            if self.fail {
                Err(DeployError::Validation("nope".into()))
            } else {
                Ok(())
            }
        }
    }

    fn queue() -> (DbHandle, TaskQueue) {
        let db = DbHandle::new(DeployDb::new_in_memory().unwrap());
        let q = TaskQueue::new(
            db.clone(),
            QueueOptions {
                wait_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        (db, q)
    }

    async fn wait_for_empty(db: &DbHandle, name: &'static str) {
        for _ in 0..500 {
            let later = Utc::now() + chrono::Duration::seconds(60);
            let rows = db
                .call(move |db| db.recoverable_tasks(name, later))
                .await
                .unwrap();
            if rows.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queued task rows were never cleared");
    }

    #[tokio::test]
    async fn test_enqueue_delivers_to_registered_handler() {
        let (db, q) = queue();
        let (tx, mut rx) = mpsc::unbounded_channel();
        q.register(
            CREATE_DEPLOYMENT,
            Arc::new(Recording {
                seen: tx,
                fail: false,
                calls: AtomicUsize::new(0),
            }),
        )
        .unwrap();
        let p = payload();
        let expected = p.correlation_id;
        q.enqueue(CREATE_DEPLOYMENT, p).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(expected));
        wait_for_empty(&db, CREATE_DEPLOYMENT).await;
    }

    #[tokio::test]
    async fn test_failed_handler_is_not_retried() {
        let (db, q) = queue();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Recording {
            seen: tx,
            fail: true,
            calls: AtomicUsize::new(0),
        });
        q.register(UPDATE_DEPLOYMENT, handler.clone()).unwrap();
        q.enqueue(UPDATE_DEPLOYMENT, payload()).await.unwrap();
        rx.recv().await.unwrap();
        wait_for_empty(&db, UPDATE_DEPLOYMENT).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enqueue_to_unknown_queue_errors() {
        let (_db, q) = queue();
        assert!(q.enqueue("nope", payload()).await.is_err());
    }

    #[tokio::test]
    async fn test_register_twice_errors() {
        let (_db, q) = queue();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Recording {
            seen: tx,
            fail: false,
            calls: AtomicUsize::new(0),
        });
        q.register(LIVE_DEV, handler.clone()).unwrap();
        assert!(q.register(LIVE_DEV, handler).is_err());
    }

    #[tokio::test]
    async fn test_recover_redelivers_persisted_rows() {
        let (db, q) = queue();
        let p = payload();
        let expected = p.correlation_id;
        let json = serde_json::to_string(&p).unwrap();
        let id = Uuid::new_v4();
        db.call(move |db| db.enqueue_task(id, RESTART_DEPLOYMENT, &json))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        q.register(
            RESTART_DEPLOYMENT,
            Arc::new(Recording {
                seen: tx,
                fail: false,
                calls: AtomicUsize::new(0),
            }),
        )
        .unwrap();
        assert_eq!(q.recover().await.unwrap(), 1);
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(expected));
        wait_for_empty(&db, RESTART_DEPLOYMENT).await;
    }

    #[tokio::test]
    async fn test_recover_drops_unreadable_rows() {
        let (db, q) = queue();
        let id = Uuid::new_v4();
        db.call(move |db| db.enqueue_task(id, REDEPLOY_DEPLOYMENT, "not json"))
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        q.register(
            REDEPLOY_DEPLOYMENT,
            Arc::new(Recording {
                seen: tx,
                fail: false,
                calls: AtomicUsize::new(0),
            }),
        )
        .unwrap();
        assert_eq!(q.recover().await.unwrap(), 0);
        wait_for_empty(&db, REDEPLOY_DEPLOYMENT).await;
    }

    struct Slow {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Slow {
        async fn handle(&self, _payload: TaskPayload) -> Result<(), DeployError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pool_scales_but_stays_bounded() {
        let db = DbHandle::new(DeployDb::new_in_memory().unwrap());
        let q = TaskQueue::new(
            db.clone(),
            QueueOptions {
                min_workers: 1,
                max_workers: 3,
                wait_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let handler = Arc::new(Slow {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        q.register(CREATE_DEPLOYMENT, handler.clone()).unwrap();
        for _ in 0..8 {
            q.enqueue(CREATE_DEPLOYMENT, payload()).await.unwrap();
        }
        wait_for_empty(&db, CREATE_DEPLOYMENT).await;
        let peak = handler.peak.load(Ordering::SeqCst);
        assert!(peak >= 2, "pool never scaled (peak {peak})");
        assert!(peak <= 3, "pool exceeded max workers (peak {peak})");
    }
}
