//! Deployment record store: the services and deployments ledger.

use uuid::Uuid;

use crate::db::{
    now_timestamp, slugify_app_name, CreateServiceRequest, Deployment, DeploymentStatus,
    DeploymentTrigger, Service, ServiceStatus,
};
use crate::DbPool;

use super::error::{DeployError, DeployResult};
use super::token::generate_token;

pub async fn get_service(db: &DbPool, service_id: &str) -> DeployResult<Option<Service>> {
    let service = sqlx::query_as::<_, Service>("SELECT * FROM services WHERE id = ?")
        .bind(service_id)
        .fetch_optional(db)
        .await?;
    Ok(service)
}

pub async fn require_service(db: &DbPool, service_id: &str) -> DeployResult<Service> {
    get_service(db, service_id)
        .await?
        .ok_or_else(|| DeployError::ServiceNotFound(service_id.to_string()))
}

pub async fn list_services(db: &DbPool) -> DeployResult<Vec<Service>> {
    let services = sqlx::query_as::<_, Service>("SELECT * FROM services ORDER BY created_at ASC")
        .fetch_all(db)
        .await?;
    Ok(services)
}

pub async fn insert_service(db: &DbPool, req: CreateServiceRequest) -> DeployResult<Service> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(DeployError::Invalid("name is required".to_string()));
    }
    let app_name = slugify_app_name(req.app_name.as_deref().unwrap_or(&name));
    if app_name.is_empty() {
        return Err(DeployError::Invalid(
            "app_name must contain at least one alphanumeric character".to_string(),
        ));
    }

    let id = Uuid::new_v4().to_string();
    let now = now_timestamp();

    sqlx::query(
        r#"
        INSERT INTO services (
            id, kind, name, app_name, status, refresh_token, auto_deploy, server_id,
            source_url, branch, image, dockerfile, compose_path, port, domain,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, 'idle', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(req.kind.as_str())
    .bind(&name)
    .bind(&app_name)
    .bind(generate_token())
    .bind(req.auto_deploy as i32)
    .bind(&req.server_id)
    .bind(&req.source_url)
    .bind(&req.branch)
    .bind(&req.image)
    .bind(&req.dockerfile)
    .bind(&req.compose_path)
    .bind(req.port.map(i32::from))
    .bind(&req.domain)
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await?;

    require_service(db, &id).await
}

pub async fn delete_service(db: &DbPool, service_id: &str) -> DeployResult<bool> {
    let result = sqlx::query("DELETE FROM services WHERE id = ?")
        .bind(service_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Write the single service status column
pub(super) async fn write_service_status(
    db: &DbPool,
    service_id: &str,
    status: ServiceStatus,
) -> DeployResult<()> {
    sqlx::query("UPDATE services SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(now_timestamp())
        .bind(service_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Write the service status unless one of its deployments is running.
///
/// The check and the write are one statement, so an executor that starts
/// concurrently either sees this write or makes it a no-op. Returns whether
/// a row was updated.
pub(super) async fn write_service_status_if_idle(
    db: &DbPool,
    service_id: &str,
    status: ServiceStatus,
) -> DeployResult<bool> {
    let result = sqlx::query(
        "UPDATE services SET status = ?, updated_at = ?
         WHERE id = ? AND NOT EXISTS (
             SELECT 1 FROM deployments WHERE service_id = ? AND status = 'running'
         )",
    )
    .bind(status.as_str())
    .bind(now_timestamp())
    .bind(service_id)
    .bind(service_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(super) async fn write_refresh_token(
    db: &DbPool,
    service_id: &str,
    token: &str,
) -> DeployResult<bool> {
    let result = sqlx::query("UPDATE services SET refresh_token = ?, updated_at = ? WHERE id = ?")
        .bind(token)
        .bind(now_timestamp())
        .bind(service_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn insert_deployment(
    db: &DbPool,
    deployment_id: &str,
    service_id: &str,
    trigger: DeploymentTrigger,
    title: &str,
    description: Option<&str>,
    log_path: &str,
) -> DeployResult<Deployment> {
    sqlx::query(
        r#"
        INSERT INTO deployments (id, service_id, status, triggered_by, title, description, log_path, created_at)
        VALUES (?, ?, 'queued', ?, ?, ?, ?, ?)
        "#,
    )
    .bind(deployment_id)
    .bind(service_id)
    .bind(trigger.as_str())
    .bind(title)
    .bind(description)
    .bind(log_path)
    .bind(now_timestamp())
    .execute(db)
    .await?;

    require_deployment(db, deployment_id).await
}

pub async fn get_deployment(db: &DbPool, deployment_id: &str) -> DeployResult<Option<Deployment>> {
    let deployment = sqlx::query_as::<_, Deployment>("SELECT * FROM deployments WHERE id = ?")
        .bind(deployment_id)
        .fetch_optional(db)
        .await?;
    Ok(deployment)
}

pub async fn require_deployment(db: &DbPool, deployment_id: &str) -> DeployResult<Deployment> {
    get_deployment(db, deployment_id)
        .await?
        .ok_or_else(|| DeployError::DeploymentNotFound(deployment_id.to_string()))
}

pub async fn find_deployment_by_log_path(
    db: &DbPool,
    log_path: &str,
) -> DeployResult<Option<Deployment>> {
    let deployment = sqlx::query_as::<_, Deployment>("SELECT * FROM deployments WHERE log_path = ?")
        .bind(log_path)
        .fetch_optional(db)
        .await?;
    Ok(deployment)
}

/// Most recent deployments for a service, newest first
pub async fn recent_deployments(
    db: &DbPool,
    service_id: &str,
    limit: u32,
) -> DeployResult<Vec<Deployment>> {
    let deployments = sqlx::query_as::<_, Deployment>(
        "SELECT * FROM deployments WHERE service_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
    )
    .bind(service_id)
    .bind(limit as i64)
    .fetch_all(db)
    .await?;
    Ok(deployments)
}

/// Deployments in a given status across all services, oldest first
pub async fn deployments_with_status(
    db: &DbPool,
    status: DeploymentStatus,
) -> DeployResult<Vec<Deployment>> {
    let deployments = sqlx::query_as::<_, Deployment>(
        "SELECT * FROM deployments WHERE status = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(status.as_str())
    .fetch_all(db)
    .await?;
    Ok(deployments)
}

/// Count running deployments for a service other than `except`
pub async fn other_running(db: &DbPool, service_id: &str, except: &str) -> DeployResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM deployments WHERE service_id = ? AND status = 'running' AND id != ?",
    )
    .bind(service_id)
    .bind(except)
    .fetch_one(db)
    .await?;
    Ok(count)
}

/// Persist a deployment status change
pub(super) async fn write_deployment_status(
    db: &DbPool,
    deployment_id: &str,
    status: DeploymentStatus,
    error: Option<&str>,
) -> DeployResult<()> {
    let now = now_timestamp();

    if status == DeploymentStatus::Running {
        sqlx::query("UPDATE deployments SET status = ?, started_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(&now)
            .bind(deployment_id)
            .execute(db)
            .await?;
    } else if status.is_terminal() {
        // finished_at is set once; a finished record never changes status again
        sqlx::query(
            "UPDATE deployments SET status = ?, error_message = ?, finished_at = ?
             WHERE id = ? AND finished_at IS NULL",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(&now)
        .bind(deployment_id)
        .execute(db)
        .await?;
    } else {
        sqlx::query("UPDATE deployments SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(deployment_id)
            .execute(db)
            .await?;
    }

    Ok(())
}
