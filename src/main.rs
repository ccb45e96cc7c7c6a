use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dockhand::api::metrics::init_metrics;
use dockhand::config::Config;
use dockhand::engine::{DeploymentEngine, ExecutorSettings, RuntimeStageRunner};
use dockhand::logs::LogSink;
use dockhand::proxy::RouteTable;
use dockhand::runtime::detect_runtime;
use dockhand::AppState;

#[derive(Parser, Debug)]
#[command(name = "dockhand")]
#[command(author, version, about = "Deployment queue, executor and log streaming for self-hosted services", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dockhand.toml", env = "DOCKHAND_CONFIG")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting dockhand v{}", env!("CARGO_PKG_VERSION"));

    for dir in [&config.server.data_dir, &config.engine.log_dir, &config.runtime.work_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let db = dockhand::db::init(&config.server.data_dir).await?;
    let metrics_handle = init_metrics()?;

    let runtime = detect_runtime(&config.runtime).await;
    let routes = Arc::new(RouteTable::new());
    let runner = Arc::new(RuntimeStageRunner::new(
        runtime,
        routes.clone(),
        config.runtime.work_dir.clone(),
    ));

    let (engine, wake_rx) = DeploymentEngine::new(
        db,
        LogSink::new(&config.engine.log_dir),
        runner,
        ExecutorSettings::from(&config.engine),
    );
    engine.recover().await?;
    tokio::spawn(engine.clone().run(wake_rx));

    let state = Arc::new(AppState::new(config.clone(), engine, routes).with_metrics(metrics_handle));
    let app = dockhand::api::create_router(state);

    let api_addr = format!("{}:{}", config.server.host, config.server.api_port);
    let listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("Failed to bind {}", api_addr))?;

    tracing::info!("API server listening on http://{}", api_addr);
    tracing::info!("Admin token: {}", config.auth.admin_token);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
