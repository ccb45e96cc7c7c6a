// Read-only view of the routing table maintained by deployments.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::proxy::Backend;
use crate::AppState;

use super::error::ApiError;

#[derive(Debug, Serialize)]
pub struct RouteInfo {
    pub domain: String,
    pub service_id: String,
    pub deployment_id: String,
    pub backend: String,
}

impl From<(String, Backend)> for RouteInfo {
    fn from((domain, backend): (String, Backend)) -> Self {
        Self {
            domain,
            backend: backend.addr(),
            service_id: backend.service_id,
            deployment_id: backend.deployment_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListRoutesResponse {
    pub routes: Vec<RouteInfo>,
    pub total: usize,
}

/// GET /api/routes
pub async fn list_routes(State(state): State<Arc<AppState>>) -> Json<ListRoutesResponse> {
    let routes: Vec<RouteInfo> = state.routes.all().into_iter().map(RouteInfo::from).collect();
    let total = routes.len();
    Json(ListRoutesResponse { routes, total })
}

/// GET /api/routes/:domain
pub async fn get_route(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> Result<Json<RouteInfo>, ApiError> {
    match state.routes.get_backend(&domain) {
        Some(backend) => Ok(Json(RouteInfo::from((domain, backend)))),
        None => Err(ApiError::not_found(format!("no route for {}", domain))),
    }
}
