//! Deployment state transitions and the service status read model.
//!
//! `apply_transition` is the only place a deployment's status changes and
//! mirrors it onto the service. Request handlers go through
//! `StatusPublisher::change_status`, which refuses while the executor holds
//! the service's run slot or any of its deployments is running.

use std::sync::Arc;

use crate::db::{Deployment, DeploymentStatus, ServiceDetail, ServiceStatus};
use crate::logs::LogSink;
use crate::DbPool;

use super::error::{DeployError, DeployResult};
use super::queue::DeploymentQueue;
use super::store;

/// Move a deployment to `to`, log it and mirror the result onto its service
pub(super) async fn apply_transition(
    db: &DbPool,
    logs: &LogSink,
    deployment: &Deployment,
    to: DeploymentStatus,
    detail: Option<&str>,
) -> DeployResult<()> {
    let from = deployment.status_enum();
    let error = if to == DeploymentStatus::Error { detail } else { None };
    store::write_deployment_status(db, &deployment.id, to, error).await?;

    let mut line = format!("[status] {} -> {}", from, to);
    if let Some(detail) = detail {
        line.push_str(": ");
        line.push_str(detail);
    }
    if let Err(e) = logs.append(&deployment.log_path, &line).await {
        tracing::warn!(deployment_id = %deployment.id, error = %e, "Failed to append status line");
    }

    let service_status = match to {
        DeploymentStatus::Queued => return Ok(()),
        DeploymentStatus::Running => ServiceStatus::Running,
        _ => {
            if store::other_running(db, &deployment.service_id, &deployment.id).await? > 0 {
                ServiceStatus::Running
            } else {
                ServiceStatus::Idle
            }
        }
    };
    mirror_service_status(db, &deployment.service_id, service_status).await?;

    tracing::info!(
        deployment_id = %deployment.id,
        service_id = %deployment.service_id,
        from = %from,
        to = %to,
        "Deployment transitioned"
    );
    Ok(())
}

async fn mirror_service_status(
    db: &DbPool,
    service_id: &str,
    status: ServiceStatus,
) -> DeployResult<()> {
    store::write_service_status(db, service_id, status).await
}

/// Read side polled by clients, plus the guarded manual status change
#[derive(Clone)]
pub struct StatusPublisher {
    db: DbPool,
    queue: Arc<DeploymentQueue>,
    display_limit: u32,
}

impl StatusPublisher {
    pub fn new(db: DbPool, queue: Arc<DeploymentQueue>, display_limit: u32) -> Self {
        Self { db, queue, display_limit }
    }

    pub async fn status(&self, service_id: &str) -> DeployResult<ServiceStatus> {
        Ok(store::require_service(&self.db, service_id).await?.get_status())
    }

    /// Service with its most recent deployments
    pub async fn one(&self, service_id: &str) -> DeployResult<ServiceDetail> {
        let service = store::require_service(&self.db, service_id).await?;
        let deployments = store::recent_deployments(&self.db, service_id, self.display_limit).await?;
        Ok(ServiceDetail::new(
            service,
            deployments,
            self.queue.is_running(service_id),
            self.queue.pending_len(service_id),
        ))
    }

    /// Most recent deployments, newest first; older records stay stored
    pub async fn all_by_service(&self, service_id: &str) -> DeployResult<Vec<Deployment>> {
        store::require_service(&self.db, service_id).await?;
        store::recent_deployments(&self.db, service_id, self.display_limit).await
    }

    /// Set a service's status by hand.
    ///
    /// Refused with `QueueConflict` while a deployment holds the run slot;
    /// `running` is reserved for the executor.
    pub async fn change_status(
        &self,
        service_id: &str,
        status: ServiceStatus,
    ) -> DeployResult<ServiceStatus> {
        store::require_service(&self.db, service_id).await?;
        if status == ServiceStatus::Running {
            return Err(DeployError::Invalid(
                "status 'running' is set by deployments only".to_string(),
            ));
        }
        if self.queue.is_running(service_id) {
            return Err(DeployError::QueueConflict(service_id.to_string()));
        }
        // The slot may be claimed after the check above; the guarded write
        // loses to any deployment that already reached `running`
        if !store::write_service_status_if_idle(&self.db, service_id, status).await? {
            store::require_service(&self.db, service_id).await?;
            return Err(DeployError::QueueConflict(service_id.to_string()));
        }
        tracing::info!(service_id = %service_id, status = %status, "Service status changed");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_pool, DeploymentTrigger};
    use crate::engine::queue::DeploymentRequest;
    use crate::engine::test_support::app_request;

    async fn seed(db: &DbPool, logs: &LogSink, id: &str) -> Deployment {
        let service = store::insert_service(db, app_request("web")).await.unwrap();
        let log_path = logs.path_for(&service.app_name, id);
        store::insert_deployment(db, id, &service.id, DeploymentTrigger::Manual, "t", None, &log_path)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_transition_mirrors_service_status() {
        let (db, dir) = test_pool().await;
        let logs = LogSink::new(dir.path().join("logs"));
        let deployment = seed(&db, &logs, "d1").await;

        apply_transition(&db, &logs, &deployment, DeploymentStatus::Running, None)
            .await
            .unwrap();
        let service = store::require_service(&db, &deployment.service_id).await.unwrap();
        assert_eq!(service.get_status(), ServiceStatus::Running);

        let deployment = store::require_deployment(&db, "d1").await.unwrap();
        apply_transition(&db, &logs, &deployment, DeploymentStatus::Error, Some("build: boom"))
            .await
            .unwrap();
        let service = store::require_service(&db, &deployment.service_id).await.unwrap();
        assert_eq!(service.get_status(), ServiceStatus::Idle);

        let stored = store::require_deployment(&db, "d1").await.unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("build: boom"));

        let lines = logs
            .read_to_vec(&deployment.log_path, Default::default())
            .await
            .unwrap();
        assert_eq!(lines, vec!["[status] queued -> running", "[status] running -> error: build: boom"]);
    }

    #[tokio::test]
    async fn test_change_status_refused_while_running() {
        let (db, dir) = test_pool().await;
        let logs = LogSink::new(dir.path().join("logs"));
        let deployment = seed(&db, &logs, "d1").await;
        let queue = Arc::new(DeploymentQueue::new());
        let publisher = StatusPublisher::new(db.clone(), queue.clone(), 10);

        queue.push(DeploymentRequest::new(
            "d1".to_string(),
            deployment.service_id.clone(),
            DeploymentTrigger::Manual,
        ));
        queue.next(&deployment.service_id).unwrap();

        let result = publisher
            .change_status(&deployment.service_id, ServiceStatus::Error)
            .await;
        assert!(matches!(result, Err(DeployError::QueueConflict(_))));
        assert_eq!(
            publisher.status(&deployment.service_id).await.unwrap(),
            ServiceStatus::Idle
        );

        queue.finish(&deployment.service_id, "d1");
        let status = publisher
            .change_status(&deployment.service_id, ServiceStatus::Done)
            .await
            .unwrap();
        assert_eq!(status, ServiceStatus::Done);
    }

    #[tokio::test]
    async fn test_change_status_loses_to_deployment_started_after_slot_check() {
        let (db, dir) = test_pool().await;
        let logs = LogSink::new(dir.path().join("logs"));
        let deployment = seed(&db, &logs, "d1").await;
        // Empty queue: the slot check passes, but the executor has already
        // moved the deployment to running
        let publisher = StatusPublisher::new(db.clone(), Arc::new(DeploymentQueue::new()), 10);
        apply_transition(&db, &logs, &deployment, DeploymentStatus::Running, None)
            .await
            .unwrap();

        let result = publisher
            .change_status(&deployment.service_id, ServiceStatus::Idle)
            .await;
        assert!(matches!(result, Err(DeployError::QueueConflict(_))));
        assert_eq!(
            publisher.status(&deployment.service_id).await.unwrap(),
            ServiceStatus::Running
        );

        let deployment = store::require_deployment(&db, "d1").await.unwrap();
        apply_transition(&db, &logs, &deployment, DeploymentStatus::Done, None)
            .await
            .unwrap();
        let status = publisher
            .change_status(&deployment.service_id, ServiceStatus::Error)
            .await
            .unwrap();
        assert_eq!(status, ServiceStatus::Error);
    }

    #[tokio::test]
    async fn test_one_reports_queue_state() {
        let (db, dir) = test_pool().await;
        let logs = LogSink::new(dir.path().join("logs"));
        let deployment = seed(&db, &logs, "d1").await;
        let publisher = StatusPublisher::new(db.clone(), Arc::new(DeploymentQueue::new()), 10);

        let detail = publisher.one(&deployment.service_id).await.unwrap();
        assert!(!detail.deploying);
        assert_eq!(detail.queued, 0);
        assert_eq!(detail.deployments.len(), 1);

        assert!(matches!(
            publisher.one("missing").await,
            Err(DeployError::ServiceNotFound(_))
        ));
    }
}
