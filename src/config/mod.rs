use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token: default_admin_token(),
        }
    }
}

fn default_admin_token() -> String {
    // Generate a random token if not provided
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_type")]
    pub runtime_type: RuntimeType,
    /// Directory where sources are checked out before a build
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_type: default_runtime_type(),
            work_dir: default_work_dir(),
        }
    }
}

fn default_runtime_type() -> RuntimeType {
    RuntimeType::Auto
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./data/builds")
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Auto,
    Docker,
    Podman,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Root directory for per-deployment log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Supervisory timeout for a single deployment, checked between stages (0 disables)
    #[serde(default = "default_deploy_timeout_secs")]
    pub deploy_timeout_secs: u64,
    /// Number of most recent deployments surfaced per service
    #[serde(default = "default_display_limit")]
    pub display_limit: u32,
    /// How often a followed log is polled for new lines
    #[serde(default = "default_log_poll_interval_ms")]
    pub log_poll_interval_ms: u64,
}

impl EngineConfig {
    pub fn deploy_timeout(&self) -> Option<Duration> {
        if self.deploy_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.deploy_timeout_secs))
        }
    }

    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms.max(50))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            deploy_timeout_secs: default_deploy_timeout_secs(),
            display_limit: default_display_limit(),
            log_poll_interval_ms: default_log_poll_interval_ms(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./data/logs")
}

fn default_deploy_timeout_secs() -> u64 {
    3600
}

fn default_display_limit() -> u32 {
    10
}

fn default_log_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config =
                toml::from_str(&content).with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.api_port, 3000);
        assert_eq!(config.engine.display_limit, 10);
        assert_eq!(config.engine.deploy_timeout(), Some(Duration::from_secs(3600)));
        assert_eq!(config.runtime.runtime_type, RuntimeType::Auto);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_engine_section() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            deploy_timeout_secs = 0
            log_dir = "/var/lib/dockhand/logs"

            [runtime]
            runtime_type = "podman"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.deploy_timeout(), None);
        assert_eq!(config.engine.log_dir, PathBuf::from("/var/lib/dockhand/logs"));
        assert_eq!(config.engine.log_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.runtime.runtime_type, RuntimeType::Podman);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/dockhand.toml")).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
    }
}
