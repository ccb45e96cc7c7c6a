mod error;
mod pipeline;
mod queue;
mod stages;
mod status;
pub mod store;
mod token;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::*;
pub use pipeline::{execute, ExecutorSettings, Stage, StageContext, StageRunner};
pub use queue::{CancelOutcome, Claim, DeploymentQueue, DeploymentRequest};
pub use stages::RuntimeStageRunner;
pub use status::StatusPublisher;
pub use token::{generate_token, tokens_match, TokenGate};

use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::metrics::record_deployment_enqueued;
use crate::db::{
    Deployment, DeploymentStatus, DeploymentTrigger, DeployRequest, ServiceDetail, ServiceStatus,
};
use crate::logs::LogSink;
use crate::DbPool;

use status::apply_transition;

/// Wake-up signal for the dispatch loop, carrying the service to look at
pub type WakeSender = mpsc::UnboundedSender<String>;
pub type WakeReceiver = mpsc::UnboundedReceiver<String>;

struct EngineInner {
    db: DbPool,
    logs: LogSink,
    queue: Arc<DeploymentQueue>,
    runner: Arc<dyn StageRunner>,
    settings: ExecutorSettings,
    tokens: TokenGate,
    status: StatusPublisher,
    wake: WakeSender,
}

/// Handle to the deployment core: queue, executor dispatch and status reads.
///
/// Cheap to clone; every clone talks to the same queue.
#[derive(Clone)]
pub struct DeploymentEngine {
    inner: Arc<EngineInner>,
}

impl DeploymentEngine {
    pub fn new(
        db: DbPool,
        logs: LogSink,
        runner: Arc<dyn StageRunner>,
        settings: ExecutorSettings,
    ) -> (Self, WakeReceiver) {
        let (wake, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(DeploymentQueue::new());
        let inner = EngineInner {
            tokens: TokenGate::new(db.clone()),
            status: StatusPublisher::new(db.clone(), queue.clone(), settings.display_limit),
            db,
            logs,
            queue,
            runner,
            settings,
            wake,
        };
        (Self { inner: Arc::new(inner) }, rx)
    }

    pub fn db(&self) -> &DbPool {
        &self.inner.db
    }

    pub fn logs(&self) -> &LogSink {
        &self.inner.logs
    }

    pub fn queue(&self) -> &DeploymentQueue {
        &self.inner.queue
    }

    pub fn tokens(&self) -> &TokenGate {
        &self.inner.tokens
    }

    /// Record a queued deployment and hand it to the dispatcher
    pub async fn enqueue(
        &self,
        service_id: &str,
        trigger: DeploymentTrigger,
        req: DeployRequest,
    ) -> DeployResult<DeploymentRequest> {
        let service = store::require_service(&self.inner.db, service_id).await?;

        let deployment_id = Uuid::new_v4().to_string();
        let log_path = self.inner.logs.path_for(&service.app_name, &deployment_id);
        let title = req
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| trigger.default_title().to_string());

        store::insert_deployment(
            &self.inner.db,
            &deployment_id,
            service_id,
            trigger,
            &title,
            req.description.as_deref(),
            &log_path,
        )
        .await?;

        if let Err(e) = self
            .inner
            .logs
            .append(&log_path, &format!("Deployment queued ({}): {}", trigger, title))
            .await
        {
            tracing::warn!(deployment_id = %deployment_id, error = %e, "Failed to create deployment log");
        }

        let request = DeploymentRequest::new(deployment_id, service_id.to_string(), trigger);
        self.inner.queue.push(request.clone());
        record_deployment_enqueued(trigger);
        tracing::info!(
            deployment_id = %request.deployment_id,
            service_id = %service_id,
            trigger = %trigger,
            "Deployment queued"
        );

        self.wake(service_id);
        Ok(request)
    }

    pub async fn deploy(&self, service_id: &str, req: DeployRequest) -> DeployResult<DeploymentRequest> {
        self.enqueue(service_id, DeploymentTrigger::Manual, req).await
    }

    /// Rebuild from the current checkout without fetching source
    pub async fn redeploy(&self, service_id: &str, req: DeployRequest) -> DeployResult<DeploymentRequest> {
        self.enqueue(service_id, DeploymentTrigger::Rebuild, req).await
    }

    /// Restart the service without building; `app_name` must match the service
    pub async fn reload(&self, service_id: &str, app_name: &str) -> DeployResult<DeploymentRequest> {
        let service = store::require_service(&self.inner.db, service_id).await?;
        if service.app_name != app_name {
            return Err(DeployError::Invalid(format!(
                "app name '{}' does not match service",
                app_name
            )));
        }
        self.enqueue(service_id, DeploymentTrigger::Reload, DeployRequest::default())
            .await
    }

    /// Start a stopped service from what is already built
    pub async fn start(&self, service_id: &str) -> DeployResult<DeploymentRequest> {
        self.enqueue(service_id, DeploymentTrigger::Start, DeployRequest::default())
            .await
    }

    /// Drop every queued request for a service and signal the running one.
    ///
    /// Returns how many queued requests were removed; zero is success.
    pub async fn cancel_all(&self, service_id: &str) -> DeployResult<usize> {
        store::require_service(&self.inner.db, service_id).await?;
        let outcome = self.inner.queue.cancel_all(service_id);

        for request in &outcome.removed {
            match store::get_deployment(&self.inner.db, &request.deployment_id).await? {
                Some(deployment) if !deployment.status_enum().is_terminal() => {
                    apply_transition(
                        &self.inner.db,
                        &self.inner.logs,
                        &deployment,
                        DeploymentStatus::Cancelled,
                        Some("removed from queue"),
                    )
                    .await?;
                }
                _ => {}
            }
        }

        if let Some(running) = &outcome.signalled {
            tracing::info!(service_id = %service_id, deployment_id = %running, "Cancellation requested for running deployment");
        }
        tracing::info!(service_id = %service_id, removed = outcome.removed.len(), "Queues cleaned");
        Ok(outcome.removed.len())
    }

    /// Claim the next request for a service if nothing is running
    pub fn next(&self, service_id: &str) -> Option<DeploymentRequest> {
        self.inner.queue.next(service_id)
    }

    pub async fn one(&self, service_id: &str) -> DeployResult<ServiceDetail> {
        self.inner.status.one(service_id).await
    }

    pub async fn all_by_service(&self, service_id: &str) -> DeployResult<Vec<Deployment>> {
        self.inner.status.all_by_service(service_id).await
    }

    pub async fn change_status(
        &self,
        service_id: &str,
        status: ServiceStatus,
    ) -> DeployResult<ServiceStatus> {
        self.inner.status.change_status(service_id, status).await
    }

    pub async fn status(&self, service_id: &str) -> DeployResult<ServiceStatus> {
        self.inner.status.status(service_id).await
    }

    pub async fn refresh_token(&self, service_id: &str) -> DeployResult<String> {
        self.inner.tokens.rotate(service_id).await
    }

    /// Remove a service with its history and logs.
    ///
    /// Refused with `QueueConflict` while a deployment is running for it; the
    /// caller cancels with `cancel_all` and retries once the slot is free.
    pub async fn delete_service(&self, service_id: &str) -> DeployResult<()> {
        let service = store::require_service(&self.inner.db, service_id).await?;
        if let Err(running) = self.inner.queue.retire(service_id) {
            tracing::info!(service_id = %service_id, deployment_id = %running, "Refusing to delete service with a running deployment");
            return Err(DeployError::QueueConflict(service_id.to_string()));
        }
        store::delete_service(&self.inner.db, service_id).await?;
        self.inner.logs.remove_service_logs(&service.app_name).await?;
        tracing::info!(service_id = %service_id, app_name = %service.app_name, "Service deleted");
        Ok(())
    }

    /// Reconcile the ledger after a restart.
    ///
    /// Deployments left running were interrupted and end as `error`; queued
    /// ones go back on their service's queue in creation order.
    pub async fn recover(&self) -> DeployResult<usize> {
        let db = &self.inner.db;

        for deployment in store::deployments_with_status(db, DeploymentStatus::Running).await? {
            tracing::warn!(deployment_id = %deployment.id, "Marking interrupted deployment as failed");
            apply_transition(
                db,
                &self.inner.logs,
                &deployment,
                DeploymentStatus::Error,
                Some("interrupted by restart"),
            )
            .await?;
        }

        let queued = store::deployments_with_status(db, DeploymentStatus::Queued).await?;
        let count = queued.len();
        for deployment in queued {
            let trigger = deployment.trigger_enum();
            self.inner.queue.push(DeploymentRequest::new(
                deployment.id,
                deployment.service_id.clone(),
                trigger,
            ));
            self.wake(&deployment.service_id);
        }

        if count > 0 {
            tracing::info!(count, "Re-queued deployments after restart");
        }
        Ok(count)
    }

    fn wake(&self, service_id: &str) {
        // The receiver only goes away at shutdown
        let _ = self.inner.wake.send(service_id.to_string());
    }

    /// Dispatch loop: start the next request of every service that is woken
    pub async fn run(self, mut rx: WakeReceiver) {
        tracing::info!("Deployment engine started");
        while let Some(service_id) = rx.recv().await {
            self.dispatch(&service_id);
        }
        tracing::info!("Deployment engine stopped");
    }

    fn dispatch(&self, service_id: &str) {
        let Some(request) = self.inner.queue.next(service_id) else {
            return;
        };

        let engine = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                deployment_id = %request.deployment_id,
                service_id = %request.service_id,
                "Processing deployment"
            );

            // Run the executor in its own task so a panic in a stage still
            // releases the run slot below
            let job = {
                let engine = engine.clone();
                let request = request.clone();
                tokio::spawn(async move {
                    let inner = &engine.inner;
                    execute(
                        &inner.db,
                        &inner.logs,
                        inner.runner.clone(),
                        &inner.settings,
                        &request,
                    )
                    .await
                })
            };

            let failure = match job.await {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e),
                Err(e) => Some(DeployError::Aborted(e.to_string())),
            };
            if let Some(e) = failure {
                tracing::error!(deployment_id = %request.deployment_id, error = %e, "Deployment aborted");
                engine.fail_unfinished(&request.deployment_id, &e).await;
            }

            engine
                .inner
                .queue
                .finish(&request.service_id, &request.deployment_id);
            engine.wake(&request.service_id);
        });
    }

    /// Best effort: end a deployment the executor could not finish
    async fn fail_unfinished(&self, deployment_id: &str, err: &DeployError) {
        let inner = &self.inner;
        if let Ok(Some(deployment)) = store::get_deployment(&inner.db, deployment_id).await {
            if !deployment.status_enum().is_terminal() {
                let message = err.to_string();
                if let Err(e) = apply_transition(
                    &inner.db,
                    &inner.logs,
                    &deployment,
                    DeploymentStatus::Error,
                    Some(&message),
                )
                .await
                {
                    tracing::error!(deployment_id = %deployment_id, error = %e, "Failed to record deployment failure");
                }
            }
        }
    }
}
