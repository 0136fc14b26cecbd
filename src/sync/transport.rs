//! Reconnecting WebSocket client for the sync protocol.
//!
//! One session task owns the socket at a time: it is the only writer (fed
//! by the outbox) and the only reader. A manager task, spawned once per
//! transport, turns connection loss into backoff and reconnect attempts.
//!
//! Every outgoing message goes through a single FIFO outbox, whether the
//! transport is connected or not. A message whose write fails is put back
//! at the front, so the order producers sent in is the order the server
//! sees across reconnects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use nixopus_common::{MessageType, SyncMessage};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::engine::MessageSink;
use crate::errors::TransportError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub state: ConnectionState,
    pub error: Option<String>,
    pub attempt: u32,
}

pub type StateCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub url: String,
    pub token: String,
    pub organization_id: Option<String>,
    /// Zero retries forever.
    pub max_reconnect_attempts: u32,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub backoff_rate: f64,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Pause after a reconnect before buffered messages are written.
    pub flush_settle: Duration,
    /// Outbox depth at which senders wait while connected.
    pub send_buffer: usize,
}

impl TransportOptions {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            organization_id: None,
            max_reconnect_attempts: 0,
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            backoff_rate: 2.0,
            ping_interval: Duration::from_secs(25),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(60),
            flush_settle: Duration::from_millis(100),
            send_buffer: 1024,
        }
    }
}

/// `min(max, initial * rate^(attempt-1))`, attempt counted from 1.
pub fn backoff_delay(attempt: u32, initial: Duration, rate: f64, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let secs = initial.as_secs_f64() * rate.powi(exponent);
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// Outgoing messages in send order.
struct Outbox {
    queue: Mutex<VecDeque<SyncMessage>>,
    capacity: usize,
    ready: Notify,
    space: Notify,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Append `message`. With `bounded` set a full outbox hands it back.
    fn try_push(&self, message: SyncMessage, bounded: bool) -> Result<(), SyncMessage> {
        let Ok(mut queue) = self.queue.lock() else {
            return Err(message);
        };
        if bounded && queue.len() >= self.capacity {
            return Err(message);
        }
        queue.push_back(message);
        drop(queue);
        self.ready.notify_one();
        Ok(())
    }

    /// Put back a message that was taken but never written.
    fn push_front(&self, message: SyncMessage) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_front(message);
        }
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<SyncMessage> {
        let message = self.queue.lock().ok()?.pop_front();
        if message.is_some() {
            self.space.notify_waiters();
        }
        message
    }

    /// Wait for the oldest message. Nothing is removed unless it is returned.
    async fn next(&self) -> SyncMessage {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(message) = self.pop() {
                return message;
            }
            notified.await;
        }
    }
}

struct Inner {
    options: TransportOptions,
    state: Mutex<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    callback: Option<StateCallback>,
    outbox: Outbox,
    incoming_tx: mpsc::UnboundedSender<SyncMessage>,
    reconnect_tx: mpsc::Sender<String>,
    connecting: AtomicBool,
    session_active: AtomicBool,
    attempt: AtomicU32,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Connect once. On failure the error is returned and no reconnect loop
    /// is started.
    pub async fn connect(
        options: TransportOptions,
        callback: Option<StateCallback>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SyncMessage>), TransportError> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            outbox: Outbox::new(options.send_buffer),
            options,
            state: Mutex::new(ConnectionState::Disconnected),
            state_tx,
            callback,
            incoming_tx,
            reconnect_tx,
            connecting: AtomicBool::new(false),
            session_active: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        inner.set_state(ConnectionState::Connecting, None);
        let socket = match inner.establish().await {
            Ok(socket) => socket,
            Err(e) => {
                inner.set_state(ConnectionState::Disconnected, Some(e.to_string()));
                return Err(e);
            }
        };
        inner.set_state(ConnectionState::Connected, None);
        Inner::spawn_session(&inner, socket, Duration::ZERO);

        let manager = tokio::spawn(Inner::manage(Arc::clone(&inner), reconnect_rx));
        inner.track(manager);
        Ok((Self { inner }, incoming_rx))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Messages accepted by [`send`](Self::send) but not yet written.
    pub fn pending_len(&self) -> usize {
        self.inner.outbox.len()
    }

    /// Queue `message`. While connected this waits for room in the outbox;
    /// otherwise the message is buffered and written after the next
    /// successful connection.
    pub async fn send(&self, mut message: SyncMessage) -> Result<(), TransportError> {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let space = self.inner.outbox.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            let bounded = match self.inner.current() {
                ConnectionState::Closed => return Err(TransportError::Closed),
                ConnectionState::Connected => true,
                _ => false,
            };
            match self.inner.outbox.try_push(message, bounded) {
                Ok(()) => return Ok(()),
                Err(back) => message = back,
            }
            tokio::select! {
                _ = &mut space => {}
                _ = closed(&mut shutdown) => return Err(TransportError::Closed),
            }
        }
    }

    /// Shut down for good and wait for the background tasks.
    pub async fn close(&self) {
        self.inner.set_state(ConnectionState::Closed, None);
        self.inner.shutdown.send_replace(true);
        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}

#[async_trait]
impl MessageSink for Transport {
    async fn send(&self, message: SyncMessage) -> Result<(), TransportError> {
        Transport::send(self, message).await
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

impl Inner {
    fn current(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Record and announce a transition. Nothing leaves `Closed`.
    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        {
            let Ok(mut current) = self.state.lock() else {
                return;
            };
            if *current == ConnectionState::Closed {
                return;
            }
            *current = state;
        }
        self.state_tx.send_replace(state);
        let change = StateChange {
            state,
            error,
            attempt: self.attempt.load(Ordering::SeqCst),
        };
        debug!(state = %change.state, attempt = change.attempt, "transport state");
        if let Some(cb) = &self.callback {
            cb(&change);
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One handshake, guarded against concurrent attempts.
    async fn establish(&self) -> Result<Socket, TransportError> {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(self.connect_error("connection attempt already in progress"));
        }
        let result = self.handshake().await;
        self.connecting.store(false, Ordering::SeqCst);
        result
    }

    fn connect_error(&self, message: impl Into<String>) -> TransportError {
        TransportError::Connect {
            url: self.options.url.clone(),
            message: message.into(),
        }
    }

    async fn handshake(&self) -> Result<Socket, TransportError> {
        let mut request = self
            .options
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| self.connect_error(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.options.token))
            .map_err(|e| self.connect_error(format!("invalid token: {e}")))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);
        if let Some(org) = self.options.organization_id.as_deref().filter(|o| !o.is_empty()) {
            let value = HeaderValue::from_str(org)
                .map_err(|e| self.connect_error(format!("invalid organization id: {e}")))?;
            request.headers_mut().insert("x-organization-id", value);
        }

        match tokio::time::timeout(
            self.options.handshake_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(self.connect_error(e.to_string())),
            Err(_) => Err(TransportError::Timeout(self.options.handshake_timeout)),
        }
    }

    /// Start the session for `socket`; writes begin after `settle`.
    fn spawn_session(inner: &Arc<Self>, socket: Socket, settle: Duration) {
        if inner
            .session_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("session already running, dropping new socket");
            return;
        }
        let session = Arc::clone(inner);
        let task = tokio::spawn(async move {
            let end = session.run_session(socket, Instant::now() + settle).await;
            session.session_active.store(false, Ordering::SeqCst);
            if let SessionEnd::Lost(reason) = end {
                if !session.is_shutdown() {
                    warn!("connection lost: {reason}");
                    session.set_state(ConnectionState::Reconnecting, Some(reason.clone()));
                    let _ = session.reconnect_tx.try_send(reason);
                }
            }
        });
        inner.track(task);
    }

    /// Reader and writer for one socket.
    async fn run_session(&self, socket: Socket, writable_at: Instant) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        let mut shutdown = self.shutdown.subscribe();
        let mut ping = tokio::time::interval_at(
            Instant::now() + self.options.ping_interval,
            self.options.ping_interval,
        );
        let mut read_deadline = Instant::now() + self.options.read_timeout;
        let write_timeout = self.options.write_timeout;

        loop {
            tokio::select! {
                _ = closed(&mut shutdown) => {
                    let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(None))).await;
                    return SessionEnd::Shutdown;
                }
                message = async {
                    tokio::time::sleep_until(writable_at).await;
                    self.outbox.next().await
                } => {
                    let text = match message.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("dropping unencodable {}: {e}", message.kind().as_str());
                            continue;
                        }
                    };
                    match tokio::time::timeout(write_timeout, sink.send(Message::Text(text.into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            self.outbox.push_front(message);
                            return SessionEnd::Lost(format!("write failed: {e}"));
                        }
                        Err(_) => {
                            self.outbox.push_front(message);
                            return SessionEnd::Lost(format!("write timed out after {write_timeout:?}"));
                        }
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            read_deadline = Instant::now() + self.options.read_timeout;
                            match SyncMessage::parse(text.as_str()) {
                                Ok(message) if message.kind() == MessageType::Pong => {}
                                Ok(message) => {
                                    let _ = self.incoming_tx.send(message);
                                }
                                Err(e) => debug!("dropping malformed frame: {e}"),
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            read_deadline = Instant::now() + self.options.read_timeout;
                        }
                        Some(Ok(Message::Close(_))) => return SessionEnd::Lost("server closed the connection".into()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return SessionEnd::Lost(format!("read failed: {e}")),
                        None => return SessionEnd::Lost("connection ended".into()),
                    }
                }
                _ = ping.tick() => {
                    match tokio::time::timeout(write_timeout, sink.send(Message::Ping(Bytes::new()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return SessionEnd::Lost(format!("ping failed: {e}")),
                        Err(_) => return SessionEnd::Lost("ping timed out".into()),
                    }
                }
                _ = tokio::time::sleep_until(read_deadline) => {
                    return SessionEnd::Lost(format!("no data for {:?}", self.options.read_timeout));
                }
            }
        }
    }

    /// Drains reconnect requests until shutdown or retries run out.
    async fn manage(inner: Arc<Self>, mut requests: mpsc::Receiver<String>) {
        let mut shutdown = inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = closed(&mut shutdown) => return,
                request = requests.recv() => {
                    if request.is_none() {
                        return;
                    }
                }
            }
            if !inner.reconnect(&mut shutdown).await {
                return;
            }
        }
    }

    /// Retry with backoff. Returns false when the manager should stop.
    async fn reconnect(self: &Arc<Self>, shutdown: &mut watch::Receiver<bool>) -> bool {
        let opts = &self.options;
        loop {
            let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
            if opts.max_reconnect_attempts > 0 && attempt > opts.max_reconnect_attempts {
                let message = format!("gave up after {} reconnect attempts", opts.max_reconnect_attempts);
                warn!("{message}");
                self.set_state(ConnectionState::Disconnected, Some(message));
                return false;
            }
            let delay = backoff_delay(
                attempt,
                opts.initial_reconnect_delay,
                opts.backoff_rate,
                opts.max_reconnect_delay,
            );
            self.set_state(ConnectionState::Reconnecting, None);
            debug!(attempt, ?delay, "reconnecting");
            tokio::select! {
                _ = closed(shutdown) => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish().await {
                Ok(socket) => {
                    self.attempt.store(0, Ordering::SeqCst);
                    self.set_state(ConnectionState::Connected, None);
                    info!(attempt, buffered = self.outbox.len(), "reconnected");
                    Inner::spawn_session(self, socket, opts.flush_settle);
                    return true;
                }
                Err(e) => {
                    warn!(attempt, "reconnect failed: {e}");
                    self.set_state(ConnectionState::Reconnecting, Some(e.to_string()));
                }
            }
        }
    }
}
