use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use nixopus_common::{ErrorPayload, MAX_MESSAGE_SIZE, Payload, SyncMessage};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api::{self, ApiError, AppState, SharedState};
use super::db::{DbHandle, DeployDb};
use super::ingest::IngestSession;
use super::live_dev::{LiveDevOrchestrator, LiveDevSettings, staging_path};
use super::pipeline::{Adapters, Pipeline, PipelineOptions};
use super::queue::{QueueOptions, TaskQueue};
use super::rotation::STARTUP_SETTLE;
use super::service::DeployService;
use crate::config::NixopusToml;
use crate::docker::engine::BollardDocker;
use crate::git::Git2Source;
use crate::proxy::CaddyProxy;
use crate::ssh::runner_from_config;

/// How long in-flight deployments get to finish on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct LiveQuery {
    pub application_id: Uuid,
}

#[derive(Clone)]
struct IngestState {
    staging_root: Arc<PathBuf>,
}

/// Full router: JSON API, webhook and the live-dev ingest socket.
pub fn build_router(state: SharedState) -> Router {
    let staging_root = state.service.staging_root();
    api::api_router()
        .with_state(state)
        .merge(live_router(staging_root))
        .layer(TraceLayer::new_for_http())
}

/// `/ws/live` alone, writing every application's files below `staging_root`.
pub fn live_router(staging_root: PathBuf) -> Router {
    Router::new()
        .route("/ws/live", get(live_handler))
        .with_state(IngestState {
            staging_root: Arc::new(staging_root),
        })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn live_handler(
    State(state): State<IngestState>,
    headers: HeaderMap,
    Query(query): Query<LiveQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if bearer_token(&headers).is_none() {
        return ApiError::Unauthorized("bearer token required".into()).into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let root = staging_path(&state.staging_root, query.application_id);
    let application_id = query.application_id;
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_live_socket(socket, application_id, IngestSession::new(root)))
}

async fn handle_live_socket(socket: WebSocket, application_id: Uuid, mut session: IngestSession) {
    let (mut sender, mut receiver) = socket.split();
    info!(app_id = %application_id, root = %session.root().display(), "live sync connected");

    while let Some(frame) = receiver.next().await {
        let parsed = match frame {
            Ok(Message::Text(text)) => SyncMessage::parse(text.as_str()),
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => SyncMessage::parse(text),
                Err(_) => {
                    debug!(app_id = %application_id, "ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(app_id = %application_id, "live sync socket error: {e}");
                break;
            }
        };

        let replies = match parsed {
            Ok(message) => session.handle(message).await,
            Err(e) => vec![SyncMessage::new(Payload::Error(ErrorPayload {
                path: None,
                message: e.to_string(),
            }))],
        };
        for reply in replies {
            let text = match reply.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(app_id = %application_id, "dropping unencodable reply: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                info!(app_id = %application_id, "live sync client went away");
                return;
            }
        }
    }

    info!(
        app_id = %application_id,
        files = session.files_written(),
        "live sync disconnected"
    );
}

/// Wire the concrete adapters, database and queues described by `config`.
pub async fn build_service(config: &NixopusToml) -> Result<Arc<DeployService>> {
    if let Some(parent) = config.storage.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    std::fs::create_dir_all(&config.storage.staging_root)
        .context("Failed to create live-dev staging directory")?;

    let db = DbHandle::new(
        DeployDb::new(&config.storage.db_path).context("Failed to initialize deployment database")?,
    );
    let docker = BollardDocker::connect(config.docker.host.as_deref())
        .context("Failed to connect to the docker engine")?;
    let adapters = Adapters {
        docker: Arc::new(docker),
        git: Arc::new(Git2Source::new(&config.storage.mount_root)),
        proxy: Arc::new(CaddyProxy::new(&config.proxy.admin_url)),
        runner: runner_from_config(&config.ssh),
    };

    let upstream_host = config.upstream_host().to_string();
    let pipeline = Arc::new(Pipeline::new(
        db.clone(),
        adapters.clone(),
        PipelineOptions {
            upstream_host: upstream_host.clone(),
            settle: STARTUP_SETTLE,
        },
    ));
    let live_dev = Arc::new(LiveDevOrchestrator::new(
        adapters,
        upstream_host,
        LiveDevSettings {
            staging_root: config.storage.staging_root.clone(),
            health_timeout: Duration::from_secs(config.live_dev.health_timeout_secs),
            health_tick: Duration::from_secs(config.live_dev.health_tick_secs.max(1)),
        },
    ));
    let queue = Arc::new(TaskQueue::new(db.clone(), QueueOptions::from(&config.queue)));

    let service = Arc::new(DeployService::new(
        db,
        queue,
        pipeline,
        live_dev,
        config.storage.mount_root.clone(),
    ));
    service.register_handlers()?;
    let recovered = service.queue().recover().await?;
    if recovered > 0 {
        info!(recovered, "resumed interrupted tasks");
    }
    Ok(service)
}

/// Run the deployment server until Ctrl+C.
pub async fn start_server(config: NixopusToml) -> Result<()> {
    let service = build_service(&config).await?;
    let mut app = build_router(Arc::new(AppState {
        service: service.clone(),
    }));
    if config.server.cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "nixopus server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    service.queue().shutdown(SHUTDOWN_GRACE).await;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
