//! Deployment models and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for DeploymentStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "done" => Self::Done,
            "error" => Self::Error,
            "cancelled" => Self::Cancelled,
            _ => Self::Queued,
        }
    }
}

/// What caused a deployment to be requested
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentTrigger {
    Manual,
    Webhook,
    Autodeploy,
    /// Rebuild from the existing checkout, skipping the source fetch
    Rebuild,
    /// Restart the running container(s) without building
    Reload,
    /// Start a stopped service as it is, without fetching, building or stopping
    Start,
}

impl DeploymentTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
            Self::Autodeploy => "autodeploy",
            Self::Rebuild => "rebuild",
            Self::Reload => "reload",
            Self::Start => "start",
        }
    }

    /// Title shown next to the deployment in listings
    pub fn default_title(&self) -> &'static str {
        match self {
            Self::Manual => "Manual deployment",
            Self::Webhook => "Deployment triggered by webhook",
            Self::Autodeploy => "Automatic deployment",
            Self::Rebuild => "Rebuild deployment",
            Self::Reload => "Reload deployment",
            Self::Start => "Start service",
        }
    }
}

impl std::fmt::Display for DeploymentTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for DeploymentTrigger {
    fn from(s: String) -> Self {
        match s.as_str() {
            "webhook" => Self::Webhook,
            "autodeploy" => Self::Autodeploy,
            "rebuild" => Self::Rebuild,
            "reload" => Self::Reload,
            "start" => Self::Start,
            _ => Self::Manual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Deployment {
    pub id: String,
    pub service_id: String,
    pub status: String,
    pub triggered_by: String,
    pub title: String,
    pub description: Option<String>,
    pub log_path: String,
    /// Failing stage and message when status is `error`
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl Deployment {
    pub fn status_enum(&self) -> DeploymentStatus {
        DeploymentStatus::from(self.status.clone())
    }

    pub fn trigger_enum(&self) -> DeploymentTrigger {
        DeploymentTrigger::from(self.triggered_by.clone())
    }
}

/// Optional body accepted by the deploy/redeploy endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployRequest {
    pub title: Option<String>,
    pub description: Option<String>,
}
