use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

use super::{BuildContext, ComposeProject, ContainerRuntime, RunConfig};

/// Container runtime driven through its command line (`docker` or `podman`)
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn docker() -> Self {
        Self::new("docker")
    }

    pub fn podman() -> Self {
        Self::new("podman")
    }

    async fn run_command(&self, args: &[String]) -> Result<String> {
        tracing::debug!(binary = %self.binary, args = ?args, "Running runtime command");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to execute {} command", self.binary))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            anyhow::bail!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                if stderr.is_empty() { &stdout } else { &stderr }
            );
        }

        // Builds report progress on stderr
        if stderr.is_empty() {
            Ok(stdout)
        } else if stdout.is_empty() {
            Ok(stderr)
        } else {
            Ok(format!("{}\n{}", stdout, stderr))
        }
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn build(&self, ctx: &BuildContext) -> Result<String> {
        let dockerfile = ctx.path.join(ctx.dockerfile.trim_start_matches("./"));
        let args = vec![
            "build".to_string(),
            "-t".to_string(),
            ctx.tag.clone(),
            "-f".to_string(),
            dockerfile.to_string_lossy().to_string(),
            ctx.path.to_string_lossy().to_string(),
        ];
        self.run_command(&args).await
    }

    async fn pull_image(&self, image: &str) -> Result<String> {
        self.run_command(&to_args(&["pull", image])).await
    }

    async fn run(&self, config: &RunConfig) -> Result<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            config.name.clone(),
            "--restart".to_string(),
            "unless-stopped".to_string(),
        ];

        if let Some(port) = config.port {
            // Random host port; resolved afterwards through `host_port`
            args.push("-p".to_string());
            args.push(format!("127.0.0.1::{}", port));
        }

        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(config.image.clone());

        self.run_command(&args).await
    }

    async fn start(&self, container: &str) -> Result<()> {
        self.run_command(&to_args(&["start", container])).await?;
        Ok(())
    }

    async fn stop(&self, container: &str) -> Result<()> {
        self.run_command(&to_args(&["stop", container])).await?;
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.run_command(&to_args(&["rm", "-f", container])).await?;
        Ok(())
    }

    async fn exists(&self, container: &str) -> Result<bool> {
        let output = self
            .run_command(&to_args(&[
                "ps",
                "-a",
                "--filter",
                &format!("name=^{}$", container),
                "--format",
                "{{.Names}}",
            ]))
            .await?;
        Ok(output.lines().any(|l| l.trim() == container))
    }

    async fn host_port(&self, container: &str, port: u16) -> Result<Option<u16>> {
        let output = self
            .run_command(&to_args(&["port", container, &port.to_string()]))
            .await?;
        Ok(parse_port_output(&output))
    }

    async fn compose(&self, project: &ComposeProject, args: &[&str]) -> Result<String> {
        let mut full = vec![
            "compose".to_string(),
            "-p".to_string(),
            project.project_name.clone(),
            "-f".to_string(),
            project.compose_file.to_string_lossy().to_string(),
        ];
        full.extend(to_args(args));
        self.run_command(&full).await
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Parse `docker port` output such as `127.0.0.1:49153` or `[::]:49153`
fn parse_port_output(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit(':').next())
        .find_map(|p| p.parse::<u16>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_output() {
        assert_eq!(parse_port_output("127.0.0.1:49153"), Some(49153));
        assert_eq!(parse_port_output("0.0.0.0:8080\n[::]:8080"), Some(8080));
        assert_eq!(parse_port_output(""), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let runtime = CliRuntime::new("dockhand-definitely-not-a-binary");
        assert!(!runtime.is_available().await);
        assert!(runtime.pull_image("alpine").await.is_err());
    }
}
