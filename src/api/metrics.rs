//! Prometheus metrics endpoint, request tracking middleware and the
//! deployment counters recorded by the engine.

use anyhow::Context;
use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::db::{DeploymentStatus, DeploymentTrigger};
use crate::AppState;

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const DEPLOYMENTS_TOTAL: &str = "deployments_total";
pub const DEPLOYMENTS_ENQUEUED_TOTAL: &str = "deployments_enqueued_total";
pub const SERVICES_TOTAL: &str = "services_total";

/// Install the Prometheus recorder. Call once at startup.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request duration in seconds");
    describe_counter!(DEPLOYMENTS_TOTAL, "Finished deployments by terminal status");
    describe_counter!(DEPLOYMENTS_ENQUEUED_TOTAL, "Deployment requests queued by trigger");
    describe_gauge!(SERVICES_TOTAL, "Number of registered services");

    Ok(handle)
}

/// GET /metrics
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Ok(count) = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM services")
        .fetch_one(&state.db)
        .await
    {
        gauge!(SERVICES_TOTAL).set(count as f64);
    }

    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Records `http_requests_total` and `http_request_duration_seconds`
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    // Matched route template keeps label cardinality bounded
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();
    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

pub fn record_deployment_enqueued(trigger: DeploymentTrigger) {
    counter!(DEPLOYMENTS_ENQUEUED_TOTAL, "trigger" => trigger.as_str()).increment(1);
}

pub fn record_deployment_finished(status: DeploymentStatus) {
    counter!(DEPLOYMENTS_TOTAL, "status" => status.as_str()).increment(1);
}
