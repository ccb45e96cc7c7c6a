mod cli;

pub use cli::CliRuntime;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::RuntimeType;

#[derive(Debug, Clone)]
pub struct BuildContext {
    pub path: PathBuf,
    pub dockerfile: String,
    pub tag: String,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub image: String,
    pub name: String,
    pub port: Option<u16>,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
}

/// A compose project on disk
#[derive(Debug, Clone)]
pub struct ComposeProject {
    pub project_name: String,
    pub compose_file: PathBuf,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime binary name, for log lines
    fn name(&self) -> &str;
    /// Build an image, returning the build output
    async fn build(&self, ctx: &BuildContext) -> Result<String>;
    /// Pull an image, returning the pull output
    async fn pull_image(&self, image: &str) -> Result<String>;
    /// Start a detached container, returning its ID
    async fn run(&self, config: &RunConfig) -> Result<String>;
    /// Start an existing, stopped container
    async fn start(&self, container: &str) -> Result<()>;
    async fn stop(&self, container: &str) -> Result<()>;
    async fn remove(&self, container: &str) -> Result<()>;
    /// Whether a container with this name exists (running or not)
    async fn exists(&self, container: &str) -> Result<bool>;
    /// Host port published for a container port
    async fn host_port(&self, container: &str, port: u16) -> Result<Option<u16>>;
    /// Run a compose subcommand for a project, returning its output
    async fn compose(&self, project: &ComposeProject, args: &[&str]) -> Result<String>;
    async fn is_available(&self) -> bool;
}

/// A no-op runtime used when no container runtime is available
pub struct NoopRuntime;

#[async_trait]
impl ContainerRuntime for NoopRuntime {
    fn name(&self) -> &str {
        "none"
    }
    async fn build(&self, _ctx: &BuildContext) -> Result<String> {
        anyhow::bail!("No container runtime available")
    }
    async fn pull_image(&self, _image: &str) -> Result<String> {
        anyhow::bail!("No container runtime available")
    }
    async fn run(&self, _config: &RunConfig) -> Result<String> {
        anyhow::bail!("No container runtime available")
    }
    async fn start(&self, _container: &str) -> Result<()> {
        anyhow::bail!("No container runtime available")
    }
    async fn stop(&self, _container: &str) -> Result<()> {
        anyhow::bail!("No container runtime available")
    }
    async fn remove(&self, _container: &str) -> Result<()> {
        anyhow::bail!("No container runtime available")
    }
    async fn exists(&self, _container: &str) -> Result<bool> {
        Ok(false)
    }
    async fn host_port(&self, _container: &str, _port: u16) -> Result<Option<u16>> {
        Ok(None)
    }
    async fn compose(&self, _project: &ComposeProject, _args: &[&str]) -> Result<String> {
        anyhow::bail!("No container runtime available")
    }
    async fn is_available(&self) -> bool {
        false
    }
}

pub async fn detect_runtime(config: &crate::config::RuntimeConfig) -> Arc<dyn ContainerRuntime> {
    match config.runtime_type {
        RuntimeType::Docker => Arc::new(CliRuntime::docker()),
        RuntimeType::Podman => Arc::new(CliRuntime::podman()),
        RuntimeType::Auto => {
            let docker = CliRuntime::docker();
            if docker.is_available().await {
                tracing::info!("Auto-detected Docker runtime");
                return Arc::new(docker);
            }

            let podman = CliRuntime::podman();
            if podman.is_available().await {
                tracing::info!("Auto-detected Podman runtime");
                return Arc::new(podman);
            }

            tracing::warn!("No container runtime available. Deployments will fail until Docker or Podman is installed.");
            Arc::new(NoopRuntime)
        }
    }
}
