use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{CreateServiceRequest, DeployRequest, Service, ServiceDetail, ServiceStatus};
use crate::engine::{store, DeployError, DeploymentRequest};
use crate::AppState;

use super::error::ApiError;

pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Service>>, ApiError> {
    Ok(Json(store::list_services(&state.db).await?))
}

pub async fn create_service(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateServiceRequest>,
) -> Result<(StatusCode, Json<Service>), ApiError> {
    let service = store::insert_service(&state.db, req).await?;
    tracing::info!(service_id = %service.id, app_name = %service.app_name, kind = %service.kind, "Service created");
    Ok((StatusCode::CREATED, Json(service)))
}

/// GET /api/services/:id, the service with its latest deployments
pub async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ServiceDetail>, ApiError> {
    Ok(Json(state.engine.one(&id).await?))
}

pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_service(&id).await?;
    state.routes.remove_service(&id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deploy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<DeployRequest>>,
) -> Result<(StatusCode, Json<DeploymentRequest>), ApiError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let request = state.engine.deploy(&id, req).await?;
    Ok((StatusCode::ACCEPTED, Json(request)))
}

pub async fn redeploy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<DeployRequest>>,
) -> Result<(StatusCode, Json<DeploymentRequest>), ApiError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let request = state.engine.redeploy(&id, req).await?;
    Ok((StatusCode::ACCEPTED, Json(request)))
}

#[derive(Debug, Deserialize)]
pub struct ReloadRequest {
    #[serde(alias = "appName")]
    pub app_name: String,
}

pub async fn reload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ReloadRequest>,
) -> Result<(StatusCode, Json<DeploymentRequest>), ApiError> {
    let request = state.engine.reload(&id, &req.app_name).await?;
    Ok((StatusCode::ACCEPTED, Json(request)))
}

/// POST /api/services/:id/start
pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<DeploymentRequest>), ApiError> {
    let request = state.engine.start(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(request)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanQueuesResponse {
    pub removed: usize,
}

pub async fn clean_queues(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CleanQueuesResponse>, ApiError> {
    let removed = state.engine.cancel_all(&id).await?;
    Ok(Json(CleanQueuesResponse { removed }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshTokenResponse {
    pub refresh_token: String,
}

pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RefreshTokenResponse>, ApiError> {
    let refresh_token = state.engine.refresh_token(&id).await?;
    Ok(Json(RefreshTokenResponse { refresh_token }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: ServiceStatus,
    /// False when the change was refused because a deployment is running
    #[serde(default = "default_applied")]
    pub applied: bool,
}

fn default_applied() -> bool {
    true
}

/// GET /api/services/:id/status, polled by dashboards
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.engine.status(&id).await?;
    Ok(Json(StatusResponse { status, applied: true }))
}

#[derive(Debug, Deserialize)]
pub struct ChangeStatusRequest {
    pub status: ServiceStatus,
}

/// PUT /api/services/:id/status
///
/// A conflict with a running deployment is a no-op that reports the
/// current status rather than an error.
pub async fn change_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ChangeStatusRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    match state.engine.change_status(&id, req.status).await {
        Ok(status) => Ok(Json(StatusResponse { status, applied: true })),
        Err(DeployError::QueueConflict(_)) => {
            let status = state.engine.status(&id).await?;
            tracing::info!(service_id = %id, "Status change ignored while a deployment is running");
            Ok(Json(StatusResponse { status, applied: false }))
        }
        Err(e) => Err(e.into()),
    }
}
