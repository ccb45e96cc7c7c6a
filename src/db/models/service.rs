//! Deployable service models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::Deployment;

/// Kind of deployable unit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Application,
    Compose,
    Database,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Compose => "compose",
            Self::Database => "database",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "application" | "app" => Ok(Self::Application),
            "compose" => Ok(Self::Compose),
            "database" | "postgres" | "mysql" | "mariadb" | "mongo" | "redis" => {
                Ok(Self::Database)
            }
            _ => Err(format!("Unknown service kind: {}", s)),
        }
    }
}

/// Status mirrored onto a service from its deployments
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Idle,
    Running,
    Done,
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown service status: {}", s)),
        }
    }
}

impl From<String> for ServiceStatus {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(Self::Idle)
    }
}

/// Deployable service entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Service {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub app_name: String,
    pub status: String,
    pub refresh_token: String,
    pub auto_deploy: i32,
    pub server_id: Option<String>,
    pub source_url: Option<String>,
    pub branch: String,
    pub image: Option<String>,
    pub dockerfile: String,
    pub compose_path: String,
    pub port: Option<i32>,
    pub domain: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Service {
    pub fn get_kind(&self) -> ServiceKind {
        self.kind.parse().unwrap_or(ServiceKind::Application)
    }

    pub fn get_status(&self) -> ServiceStatus {
        ServiceStatus::from(self.status.clone())
    }

    pub fn auto_deploy_enabled(&self) -> bool {
        self.auto_deploy != 0
    }

    /// Container name for single-container kinds
    pub fn container_name(&self) -> String {
        format!("dockhand-{}", self.app_name)
    }

    /// Project name passed to `compose -p`
    pub fn compose_project_name(&self) -> String {
        format!("dockhand-svc-{}", self.app_name)
    }

    /// Image started for this service: the configured image, or the tag a build produces
    pub fn run_image(&self) -> Option<String> {
        if self.source_url.is_some() {
            Some(self.build_tag())
        } else {
            self.image.clone()
        }
    }

    /// Tag produced by source builds; stable so a reload restarts the latest build
    pub fn build_tag(&self) -> String {
        format!("dockhand-{}:latest", self.app_name)
    }
}

/// Request body for registering a service
#[derive(Debug, Clone, Deserialize)]
pub struct CreateServiceRequest {
    pub kind: ServiceKind,
    pub name: String,
    /// Runtime-facing name; derived from `name` when absent
    pub app_name: Option<String>,
    #[serde(default = "default_auto_deploy")]
    pub auto_deploy: bool,
    pub server_id: Option<String>,
    pub source_url: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub image: Option<String>,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    #[serde(default = "default_compose_path")]
    pub compose_path: String,
    pub port: Option<u16>,
    pub domain: Option<String>,
}

fn default_auto_deploy() -> bool {
    true
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_compose_path() -> String {
    "docker-compose.yml".to_string()
}

/// Read model for a single service (`one`)
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDetail {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub app_name: String,
    pub status: String,
    pub refresh_token: String,
    pub auto_deploy: bool,
    pub server_id: Option<String>,
    pub source_url: Option<String>,
    pub branch: String,
    pub image: Option<String>,
    pub port: Option<i32>,
    pub domain: Option<String>,
    /// Whether a deployment currently holds the service's run slot
    pub deploying: bool,
    /// Number of requests waiting behind the running one
    pub queued: usize,
    pub deployments: Vec<Deployment>,
    pub created_at: String,
    pub updated_at: String,
}

impl ServiceDetail {
    pub fn new(service: Service, deployments: Vec<Deployment>, deploying: bool, queued: usize) -> Self {
        Self {
            auto_deploy: service.auto_deploy_enabled(),
            id: service.id,
            kind: service.kind,
            name: service.name,
            app_name: service.app_name,
            status: service.status,
            refresh_token: service.refresh_token,
            server_id: service.server_id,
            source_url: service.source_url,
            branch: service.branch,
            image: service.image,
            port: service.port,
            domain: service.domain,
            deploying,
            queued,
            deployments,
            created_at: service.created_at,
            updated_at: service.updated_at,
        }
    }
}

/// Derive a runtime-safe name (lowercase alphanumerics and dashes)
pub fn slugify_app_name(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
