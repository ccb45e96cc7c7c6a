pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod logs;
pub mod proxy;
pub mod runtime;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::engine::DeploymentEngine;
use crate::logs::LogSink;
use crate::proxy::RouteTable;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub engine: DeploymentEngine,
    pub logs: LogSink,
    pub routes: Arc<RouteTable>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Config, engine: DeploymentEngine, routes: Arc<RouteTable>) -> Self {
        Self {
            config,
            db: engine.db().clone(),
            logs: engine.logs().clone(),
            engine,
            routes,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}
