//! Stage side effects against a container runtime.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

use crate::db::{Service, ServiceKind};
use crate::proxy::{Backend, RouteTable};
use crate::runtime::{BuildContext, ComposeProject, ContainerRuntime, RunConfig};

use super::pipeline::{Stage, StageContext, StageRunner};

/// Output longer than this is cut before it goes into the deployment log
const MAX_OUTPUT_LOG: usize = 4000;

pub struct RuntimeStageRunner {
    runtime: Arc<dyn ContainerRuntime>,
    routes: Arc<RouteTable>,
    work_dir: PathBuf,
}

impl RuntimeStageRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, routes: Arc<RouteTable>, work_dir: PathBuf) -> Self {
        Self { runtime, routes, work_dir }
    }

    /// Checkout directory for a service's source
    fn checkout_dir(&self, service: &Service) -> PathBuf {
        self.work_dir.join(&service.app_name)
    }

    fn compose_project(&self, service: &Service) -> ComposeProject {
        ComposeProject {
            project_name: service.compose_project_name(),
            compose_file: self.checkout_dir(service).join(&service.compose_path),
        }
    }

    async fn fetch_source(&self, ctx: &StageContext) -> Result<()> {
        let service = &ctx.service;
        let Some(url) = service.source_url.as_deref() else {
            ctx.log("No source repository configured, skipping fetch").await;
            return Ok(());
        };

        let dest = self.checkout_dir(service);
        ctx.log(&format!("Cloning {} (branch {})", url, service.branch)).await;
        clone_repository(url, &service.branch, &dest).await?;
        ctx.log("Source fetched").await;
        Ok(())
    }

    async fn build(&self, ctx: &StageContext) -> Result<()> {
        let service = &ctx.service;
        match service.get_kind() {
            ServiceKind::Compose => {
                let project = self.compose_project(service);
                ensure_compose_file(&project)?;
                let output = self.runtime.compose(&project, &["build", "--pull"]).await?;
                log_output(ctx, &output).await;
            }
            ServiceKind::Application if service.source_url.is_some() => {
                let build = BuildContext {
                    path: self.checkout_dir(service),
                    dockerfile: service.dockerfile.clone(),
                    tag: service.build_tag(),
                };
                ctx.log(&format!("Building image {} with {}", build.tag, self.runtime.name()))
                    .await;
                let output = self.runtime.build(&build).await?;
                log_output(ctx, &output).await;
            }
            ServiceKind::Application | ServiceKind::Database => {
                let image = service
                    .image
                    .as_deref()
                    .context("service has neither a source repository nor an image")?;
                ctx.log(&format!("Pulling image {}", image)).await;
                let output = self.runtime.pull_image(image).await?;
                log_output(ctx, &output).await;
            }
        }
        Ok(())
    }

    async fn stop_old(&self, ctx: &StageContext) -> Result<()> {
        let service = &ctx.service;
        if service.get_kind() == ServiceKind::Compose {
            let project = self.compose_project(service);
            if !project.compose_file.exists() {
                ctx.log("No compose file on disk, nothing to stop").await;
                return Ok(());
            }
            let output = self.runtime.compose(&project, &["down", "--remove-orphans"]).await?;
            log_output(ctx, &output).await;
            return Ok(());
        }

        let name = service.container_name();
        if !self.runtime.exists(&name).await? {
            ctx.log(&format!("No existing container {}", name)).await;
            return Ok(());
        }
        ctx.log(&format!("Stopping container {}", name)).await;
        if let Err(e) = self.runtime.stop(&name).await {
            // A stopped container still has to be removed
            tracing::debug!(container = %name, error = %e, "Stop failed, removing anyway");
        }
        self.runtime
            .remove(&name)
            .await
            .with_context(|| format!("failed to remove container {}", name))?;
        Ok(())
    }

    async fn start_new(&self, ctx: &StageContext) -> Result<()> {
        let service = &ctx.service;
        if service.get_kind() == ServiceKind::Compose {
            let project = self.compose_project(service);
            ensure_compose_file(&project)?;
            let output = self.runtime.compose(&project, &["up", "-d"]).await?;
            log_output(ctx, &output).await;
            return Ok(());
        }

        let name = service.container_name();
        // Only a start leaves the old container in place; every other plan
        // removed it in `stop_old`
        if self.runtime.exists(&name).await? {
            ctx.log(&format!("Starting existing container {}", name)).await;
            self.runtime
                .start(&name)
                .await
                .with_context(|| format!("failed to start container {}", name))?;
            return Ok(());
        }

        let image = service
            .run_image()
            .context("service has no image to start")?;
        let config = RunConfig {
            image,
            name,
            port: service.port.and_then(|p| u16::try_from(p).ok()),
            env: Vec::new(),
            labels: vec![
                ("dockhand.service".to_string(), service.id.clone()),
                ("dockhand.deployment".to_string(), ctx.deployment.id.clone()),
            ],
        };
        ctx.log(&format!("Starting container {} from {}", config.name, config.image))
            .await;
        let container_id = self.runtime.run(&config).await?;
        ctx.log(&format!("Container started: {}", short_id(&container_id))).await;
        Ok(())
    }

    async fn update_routing(&self, ctx: &StageContext) -> Result<()> {
        let service = &ctx.service;
        let (Some(domain), Some(port)) = (service.domain.as_deref(), service.port) else {
            ctx.log("No domain configured, skipping routing").await;
            return Ok(());
        };
        if service.get_kind() == ServiceKind::Compose {
            ctx.log("Compose services publish their own routes, skipping").await;
            return Ok(());
        }

        let container_port = u16::try_from(port).context("invalid container port")?;
        let host_port = self
            .runtime
            .host_port(&service.container_name(), container_port)
            .await?
            .with_context(|| format!("container port {} is not published", container_port))?;

        self.routes.add_route(
            domain.to_string(),
            Backend {
                service_id: service.id.clone(),
                deployment_id: ctx.deployment.id.clone(),
                host: "127.0.0.1".to_string(),
                port: host_port,
            },
        );
        ctx.log(&format!("Routing {} -> 127.0.0.1:{}", domain, host_port)).await;
        Ok(())
    }
}

#[async_trait]
impl StageRunner for RuntimeStageRunner {
    async fn run_stage(&self, stage: Stage, ctx: &StageContext) -> Result<()> {
        match stage {
            Stage::FetchSource => self.fetch_source(ctx).await,
            Stage::Build => self.build(ctx).await,
            Stage::StopOld => self.stop_old(ctx).await,
            Stage::StartNew => self.start_new(ctx).await,
            Stage::UpdateRouting => self.update_routing(ctx).await,
        }
    }
}

fn ensure_compose_file(project: &ComposeProject) -> Result<()> {
    if !project.compose_file.exists() {
        anyhow::bail!("compose file not found: {}", project.compose_file.display());
    }
    Ok(())
}

async fn log_output(ctx: &StageContext, output: &str) {
    let output = output.trim();
    if output.is_empty() {
        return;
    }
    ctx.log(&truncate_output(output)).await;
}

fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_LOG {
        return output.to_string();
    }
    let mut cut = output.len() - MAX_OUTPUT_LOG;
    while !output.is_char_boundary(cut) {
        cut += 1;
    }
    format!("... (truncated)\n{}", &output[cut..])
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Shallow-clone a branch into `dest`, replacing any previous checkout
async fn clone_repository(url: &str, branch: &str, dest: &Path) -> Result<()> {
    if dest.exists() {
        tokio::fs::remove_dir_all(dest)
            .await
            .with_context(|| format!("failed to clear {}", dest.display()))?;
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let output = Command::new("git")
        .args(["clone", "--depth", "1", "--branch", branch, url])
        .arg(dest)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to execute git clone")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git clone failed: {}", stderr.trim());
    }
    Ok(())
}
