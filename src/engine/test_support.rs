//! Shared fixtures for engine and API tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::db::{CreateServiceRequest, ServiceKind};

use super::pipeline::{Stage, StageContext, StageRunner};

pub(crate) fn app_request(name: &str) -> CreateServiceRequest {
    CreateServiceRequest {
        kind: ServiceKind::Application,
        name: name.to_string(),
        app_name: None,
        auto_deploy: true,
        server_id: None,
        source_url: None,
        branch: "main".to_string(),
        image: Some("nginx:alpine".to_string()),
        dockerfile: "Dockerfile".to_string(),
        compose_path: "docker-compose.yml".to_string(),
        port: Some(80),
        domain: None,
    }
}

/// Stage runner that records what ran and can fail, stall or block on cue
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    pub calls: Mutex<Vec<(String, Stage)>>,
    fail_at: Option<Stage>,
    panic_at: Option<Stage>,
    block_at: Option<(Stage, CancellationToken)>,
    entered: Arc<Notify>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(stage: Stage) -> Self {
        Self {
            fail_at: Some(stage),
            ..Self::default()
        }
    }

    pub fn panicking_at(stage: Stage) -> Self {
        Self {
            panic_at: Some(stage),
            ..Self::default()
        }
    }

    /// Block inside `stage` until the returned token is cancelled
    pub fn blocking_at(stage: Stage) -> (Self, CancellationToken) {
        let release = CancellationToken::new();
        let runner = Self {
            block_at: Some((stage, release.clone())),
            ..Self::default()
        };
        (runner, release)
    }

    /// Sleep this long in every stage
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Resolves once a blocking stage has been entered
    pub fn entered(&self) -> Arc<Notify> {
        self.entered.clone()
    }

    pub fn stages_for(&self, deployment_id: &str) -> Vec<Stage> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == deployment_id)
            .map(|(_, s)| *s)
            .collect()
    }

    /// Highest number of stages that ever ran at the same time
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn deployment_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for (id, _) in self.calls.lock().unwrap().iter() {
            if order.last() != Some(id) {
                order.push(id.clone());
            }
        }
        order
    }
}

#[async_trait]
impl StageRunner for ScriptedRunner {
    async fn run_stage(&self, stage: Stage, ctx: &StageContext) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.deployment.id.clone(), stage));
        ctx.log(&format!("running {}", stage)).await;

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((at, release)) = &self.block_at {
            if *at == stage {
                self.entered.notify_one();
                release.cancelled().await;
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.panic_at == Some(stage) {
            panic!("{} panicked", stage);
        }

        if self.fail_at == Some(stage) {
            anyhow::bail!("{} exploded", stage);
        }
        Ok(())
    }
}
