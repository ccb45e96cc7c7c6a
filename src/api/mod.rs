pub mod auth;
mod deployments;
pub mod error;
mod logs;
pub mod metrics;
mod routes;
mod services;
mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Protected API routes
    let api_routes = Router::new()
        // Services
        .route("/services", get(services::list_services).post(services::create_service))
        .route(
            "/services/:id",
            get(services::get_service).delete(services::delete_service),
        )
        .route("/services/:id/deploy", post(services::deploy))
        .route("/services/:id/redeploy", post(services::redeploy))
        .route("/services/:id/reload", post(services::reload))
        .route("/services/:id/start", post(services::start))
        .route("/services/:id/clean-queues", post(services::clean_queues))
        .route("/services/:id/refresh-token", post(services::refresh_token))
        .route(
            "/services/:id/status",
            get(services::get_status).put(services::change_status),
        )
        // Deployments
        .route("/services/:id/deployments", get(deployments::list_deployments))
        .route("/deployments/:id", get(deployments::get_deployment))
        // Logs
        .route("/logs", get(logs::read_logs))
        .route("/logs/stream", get(logs::stream_logs))
        // Routing table
        .route("/routes", get(routes::list_routes))
        .route("/routes/:domain", get(routes::get_route))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    // The refresh token in the path is the credential
    let webhook_routes = Router::new().route("/deploy/:kind/:token", post(webhooks::deploy_webhook));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .nest("/api", api_routes.merge(webhook_routes))
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
