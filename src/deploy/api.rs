use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use super::models::{
    CreateDeploymentRequest, Environment, LiveDevRequest, UpdateDeploymentRequest, UpdateOptions,
};
use super::service::DeployService;
use super::webhook;
use crate::errors::DeployError;

pub const ORGANIZATION_HEADER: &str = "x-organization-id";
pub const GITHUB_EVENT_HEADER: &str = "x-github-event";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: Arc<DeployService>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RedeployQuery {
    pub force: bool,
    pub force_without_cache: bool,
}

#[derive(Debug, Deserialize)]
pub struct FamilyRequest {
    pub environment: Environment,
}

#[derive(Debug, Deserialize)]
pub struct DomainRequest {
    pub domain: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogsQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub tail: Option<u32>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::Validation(_) => ApiError::BadRequest(err.to_string()),
            DeployError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            DeployError::ContainerNotRunning => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(format!("{other:#}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/webhook", post(receive_webhook))
        .route("/api/deployments", post(create_deployment).put(update_deployment))
        .route("/api/drafts", post(create_draft))
        .route("/api/live-dev", post(start_live_dev))
        .route("/api/applications", get(list_applications))
        .route(
            "/api/applications/{id}",
            get(get_application).delete(delete_application),
        )
        .route("/api/applications/{id}/redeploy", post(redeploy))
        .route("/api/applications/{id}/restart", post(restart))
        .route("/api/applications/{id}/deploy", post(deploy_draft))
        .route("/api/applications/{id}/family", get(get_family).post(add_to_family))
        .route("/api/applications/{id}/domains", post(add_domain))
        .route("/api/applications/{id}/domains/{domain}", delete(remove_domain))
        .route("/api/applications/{id}/deployments", get(list_deployments))
        .route("/api/applications/{id}/logs", get(container_logs))
        .route("/api/applications/{id}/live-dev", delete(stop_live_dev))
        .route("/api/deployments/{id}/rollback", post(rollback))
        .route("/api/deployments/{id}/status", get(deployment_status))
        .route("/api/deployments/{id}/logs", get(deployment_logs))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Organization scope from the `X-Organization-Id` header.
pub fn organization_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let value = headers
        .get(ORGANIZATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("X-Organization-Id header is required".into()))?;
    Uuid::parse_str(value.trim())
        .map_err(|_| ApiError::BadRequest(format!("invalid organization id '{value}'")))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn receive_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let event = headers
        .get(GITHUB_EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let response = webhook::handle_event(&state.service, event, &body).await?;
    Ok(Json(response))
}

async fn create_deployment(
    State(state): State<SharedState>,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let triggered = state.service.create_deployment(req).await?;
    Ok((StatusCode::CREATED, Json(triggered)))
}

async fn update_deployment(
    State(state): State<SharedState>,
    Json(req): Json<UpdateDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let triggered = state.service.update_deployment(req).await?;
    Ok((StatusCode::ACCEPTED, Json(triggered)))
}

async fn create_draft(
    State(state): State<SharedState>,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let triggered = state.service.create_draft_project(req).await?;
    Ok((StatusCode::CREATED, Json(triggered)))
}

async fn start_live_dev(
    State(state): State<SharedState>,
    Json(req): Json<LiveDevRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let triggered = state.service.live_dev(req).await?;
    Ok((StatusCode::ACCEPTED, Json(triggered)))
}

async fn list_applications(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    Ok(Json(state.service.list_applications(org).await?))
}

async fn get_application(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    Ok(Json(state.service.get_application(id, org).await?))
}

async fn delete_application(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    state.service.delete_application(id, org).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn redeploy(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<RedeployQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    let options = UpdateOptions {
        force: query.force,
        force_without_cache: query.force_without_cache,
    };
    let triggered = state.service.redeploy(id, org, options).await?;
    Ok((StatusCode::ACCEPTED, Json(triggered)))
}

async fn restart(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    let triggered = state.service.restart(id, org).await?;
    Ok((StatusCode::ACCEPTED, Json(triggered)))
}

async fn deploy_draft(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    let triggered = state.service.deploy_draft(id, org).await?;
    Ok((StatusCode::ACCEPTED, Json(triggered)))
}

async fn get_family(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    Ok(Json(state.service.family(id, org).await?))
}

async fn add_to_family(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<FamilyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    let app = state.service.add_to_family(id, org, req.environment).await?;
    Ok((StatusCode::CREATED, Json(app)))
}

async fn add_domain(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<DomainRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    let domain = state.service.add_domain(id, org, &req.domain).await?;
    Ok((StatusCode::CREATED, Json(domain)))
}

async fn remove_domain(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((id, domain)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    state.service.remove_domain(id, org, &domain).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_deployments(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    Ok(Json(state.service.list_deployments(id, org).await?))
}

async fn container_logs(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    Ok(state.service.container_logs(id, org, query.tail).await?)
}

async fn stop_live_dev(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    let stopped = state.service.stop_live_dev(id, org).await?;
    Ok(Json(serde_json::json!({"stopped": stopped})))
}

async fn rollback(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    let triggered = state.service.rollback(id, org).await?;
    Ok((StatusCode::ACCEPTED, Json(triggered)))
}

async fn deployment_status(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.deployment_status(id).await?))
}

async fn deployment_logs(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let org = organization_id(&headers)?;
    let page = state
        .service
        .get_logs(id, org, query.page.unwrap_or(1), query.page_size.unwrap_or(100))
        .await?;
    Ok(Json(page))
}

// ── Tests ─────────────────────────────────────────────────────────────
