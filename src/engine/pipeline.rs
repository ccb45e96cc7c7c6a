//! Deployment executor: runs one claimed request through its stages.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::metrics::record_deployment_finished;
use crate::config::EngineConfig;
use crate::db::{Deployment, DeploymentStatus, DeploymentTrigger, Service, ServiceKind};
use crate::logs::LogSink;
use crate::DbPool;

use super::error::{DeployError, DeployResult};
use super::queue::DeploymentRequest;
use super::status::apply_transition;
use super::store;

/// One step of a deployment pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FetchSource,
    Build,
    StopOld,
    StartNew,
    UpdateRouting,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchSource => "fetch_source",
            Self::Build => "build",
            Self::StopOld => "stop_old",
            Self::StartNew => "start_new",
            Self::UpdateRouting => "update_routing",
        }
    }

    /// Ordered stages for a service kind and trigger
    pub fn plan(kind: ServiceKind, trigger: DeploymentTrigger) -> Vec<Stage> {
        use Stage::*;

        match trigger {
            DeploymentTrigger::Reload => return vec![StopOld, StartNew],
            DeploymentTrigger::Start => {
                return match kind {
                    ServiceKind::Application => vec![StartNew, UpdateRouting],
                    ServiceKind::Compose | ServiceKind::Database => vec![StartNew],
                };
            }
            _ => {}
        }

        let mut stages = match kind {
            ServiceKind::Application | ServiceKind::Compose => {
                vec![FetchSource, Build, StopOld, StartNew, UpdateRouting]
            }
            ServiceKind::Database => vec![Build, StopOld, StartNew],
        };
        if trigger == DeploymentTrigger::Rebuild {
            stages.retain(|s| *s != FetchSource);
        }
        stages
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stage can see while it runs
pub struct StageContext {
    pub service: Service,
    pub deployment: Deployment,
    logs: LogSink,
}

impl StageContext {
    pub fn new(service: Service, deployment: Deployment, logs: LogSink) -> Self {
        Self { service, deployment, logs }
    }

    /// Append progress output to the deployment log
    pub async fn log(&self, line: &str) {
        if let Err(e) = self.logs.append(&self.deployment.log_path, line).await {
            tracing::warn!(deployment_id = %self.deployment.id, error = %e, "Failed to append log line");
        }
    }
}

/// Performs the side effects of individual stages
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run_stage(&self, stage: Stage, ctx: &StageContext) -> anyhow::Result<()>;
}

/// Executor tunables
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Wall-clock budget checked at stage boundaries; `None` disables it
    pub deploy_timeout: Option<Duration>,
    pub display_limit: u32,
}

impl From<&EngineConfig> for ExecutorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            deploy_timeout: config.deploy_timeout(),
            display_limit: config.display_limit,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            deploy_timeout: Some(Duration::from_secs(3600)),
            display_limit: 10,
        }
    }
}

/// Run a claimed request to a terminal state.
///
/// Stage failures never escape: they end the deployment as `error` and are
/// only visible through its status and log. The returned error covers
/// ledger failures only.
pub async fn execute(
    db: &DbPool,
    logs: &LogSink,
    runner: Arc<dyn StageRunner>,
    settings: &ExecutorSettings,
    request: &DeploymentRequest,
) -> DeployResult<DeploymentStatus> {
    let deployment = store::require_deployment(db, &request.deployment_id).await?;
    if deployment.status_enum() != DeploymentStatus::Queued {
        tracing::warn!(
            deployment_id = %deployment.id,
            status = %deployment.status,
            "Skipping deployment that is no longer queued"
        );
        return Ok(deployment.status_enum());
    }
    let service = store::require_service(db, &request.service_id).await?;

    apply_transition(db, logs, &deployment, DeploymentStatus::Running, None).await?;
    let deployment = store::require_deployment(db, &deployment.id).await?;

    let stages = Stage::plan(service.get_kind(), request.trigger);
    let ctx = StageContext::new(service, deployment, logs.clone());
    ctx.log(&format!(
        "Deploying {} ({}) via {}: {}",
        ctx.service.app_name,
        ctx.service.kind,
        request.trigger,
        stages.iter().map(Stage::as_str).collect::<Vec<_>>().join(" -> ")
    ))
    .await;

    let started = Instant::now();
    let mut outcome: Option<(DeploymentStatus, Option<String>)> = None;

    for stage in stages {
        // Checkpoint: cancellation and the supervisory timeout are only honoured here
        if request.cancel.is_cancelled() {
            outcome = Some((DeploymentStatus::Cancelled, Some(DeployError::Cancelled.to_string())));
            break;
        }
        if let Some(limit) = settings.deploy_timeout {
            if started.elapsed() >= limit {
                let err = DeployError::TimedOut(limit.as_secs());
                outcome = Some((DeploymentStatus::Error, Some(err.to_string())));
                break;
            }
        }

        ctx.log(&format!("==> {}", stage)).await;
        let stage_started = Instant::now();
        match runner.run_stage(stage, &ctx).await {
            Ok(()) => {
                tracing::debug!(
                    deployment_id = %ctx.deployment.id,
                    stage = %stage,
                    elapsed_ms = stage_started.elapsed().as_millis() as u64,
                    "Stage completed"
                );
            }
            Err(e) => {
                let failure = DeployError::PipelineStageFailure {
                    stage,
                    message: format!("{:#}", e),
                };
                tracing::error!(deployment_id = %ctx.deployment.id, error = %failure, "Deployment failed");
                ctx.log(&failure.to_string()).await;
                outcome = Some((DeploymentStatus::Error, Some(failure.to_string())));
                break;
            }
        }
    }

    let (status, detail) = outcome.unwrap_or((DeploymentStatus::Done, None));
    apply_transition(db, logs, &ctx.deployment, status, detail.as_deref()).await?;
    record_deployment_finished(status);
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_per_kind_and_trigger() {
        use Stage::*;
        assert_eq!(
            Stage::plan(ServiceKind::Application, DeploymentTrigger::Manual),
            vec![FetchSource, Build, StopOld, StartNew, UpdateRouting]
        );
        assert_eq!(
            Stage::plan(ServiceKind::Compose, DeploymentTrigger::Rebuild),
            vec![Build, StopOld, StartNew, UpdateRouting]
        );
        assert_eq!(
            Stage::plan(ServiceKind::Database, DeploymentTrigger::Webhook),
            vec![Build, StopOld, StartNew]
        );
        assert_eq!(
            Stage::plan(ServiceKind::Application, DeploymentTrigger::Reload),
            vec![StopOld, StartNew]
        );
        assert_eq!(
            Stage::plan(ServiceKind::Application, DeploymentTrigger::Start),
            vec![StartNew, UpdateRouting]
        );
        assert_eq!(
            Stage::plan(ServiceKind::Compose, DeploymentTrigger::Start),
            vec![StartNew]
        );
    }

    #[test]
    fn test_stage_failure_message_names_stage() {
        let err = DeployError::PipelineStageFailure {
            stage: Stage::Build,
            message: "exit status 1".to_string(),
        };
        assert_eq!(err.to_string(), "stage build failed: exit status 1");
    }
}
