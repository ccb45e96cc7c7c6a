use crate::logs::LogError;

use super::Stage;

/// Errors raised by the deployment core
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Bad or rotated refresh token; never reveals whether the service exists
    #[error("unauthorized")]
    Unauthorized,

    /// A deployment already holds the service's run slot
    #[error("a deployment is already running for service {0}")]
    QueueConflict(String),

    #[error("stage {stage} failed: {message}")]
    PipelineStageFailure { stage: Stage, message: String },

    #[error("deployment cancelled")]
    Cancelled,

    #[error("deployment timed out after {0}s")]
    TimedOut(u64),

    /// The executor task died without reaching a terminal state
    #[error("deployment aborted: {0}")]
    Aborted(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type DeployResult<T> = std::result::Result<T, DeployError>;
