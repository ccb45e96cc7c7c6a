use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::db::Deployment;
use crate::engine::store;
use crate::AppState;

use super::error::ApiError;

/// GET /api/services/:id/deployments, most recent first
pub async fn list_deployments(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<String>,
) -> Result<Json<Vec<Deployment>>, ApiError> {
    Ok(Json(state.engine.all_by_service(&service_id).await?))
}

pub async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    Ok(Json(store::require_deployment(&state.db, &id).await?))
}
