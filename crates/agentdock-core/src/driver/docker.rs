//! Container engine access through the docker CLI

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Everything needed to run one agent container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub env: HashMap<String, String>,
    /// Port published to an engine-assigned host port
    pub container_port: u16,
}

/// Container lifecycle operations the container driver relies on
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn build_image(&self, context: &Path, tag: &str) -> Result<()>;

    /// Create and start a container, returning its id
    async fn run(&self, spec: &ContainerSpec) -> Result<String>;

    /// Host port mapped to `container_port`
    async fn host_port(&self, container_id: &str, container_port: u16) -> Result<u16>;

    async fn is_running(&self, container_id: &str) -> Result<bool>;

    async fn start(&self, container_id: &str) -> Result<()>;

    async fn stop(&self, container_id: &str) -> Result<()>;

    async fn remove(&self, container_id: &str) -> Result<()>;
}

/// [`ContainerEngine`] backed by the `docker` binary
pub struct DockerCli {
    bin: String,
    build_timeout: Duration,
}

struct CliOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>, build_timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            build_timeout,
        }
    }

    async fn exec(&self, args: &[String]) -> Result<CliOutput> {
        debug!("Executing: {} {}", self.bin, args.join(" "));

        let output = Command::new(&self.bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Internal(format!("Failed to execute {}: {}", self.bin, e)))?;

        Ok(CliOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run and require a zero exit code, returning stdout
    async fn exec_ok(&self, args: &[String]) -> Result<String> {
        let output = self.exec(args).await?;
        if output.exit_code != 0 {
            return Err(Error::Internal(format!(
                "{} {} exited with {}: {}",
                self.bin,
                args.first().map(String::as_str).unwrap_or(""),
                output.exit_code,
                output.stderr
            )));
        }
        Ok(output.stdout)
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Parse the first `host:port` line printed by `docker port`
fn parse_port_line(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit(':').next())
        .find_map(|port| port.trim().parse().ok())
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn build_image(&self, context: &Path, tag: &str) -> Result<()> {
        info!("Building image {} from {:?}", tag, context);
        let context = context.to_string_lossy();
        let build_args = args(["build", "-t", tag, &context]);

        match tokio::time::timeout(self.build_timeout, self.exec_ok(&build_args)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(Error::Internal(format!(
                "Image build for {} timed out after {:?}",
                tag, self.build_timeout
            ))),
        }
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        let mut cmd = args(["run", "-d", "--name", &spec.name]);
        cmd.push("-p".to_string());
        cmd.push(format!("127.0.0.1::{}", spec.container_port));

        let mut env: Vec<_> = spec.env.iter().collect();
        env.sort();
        for (key, value) in env {
            cmd.push("-e".to_string());
            cmd.push(format!("{}={}", key, value));
        }
        cmd.push(spec.image.clone());

        self.exec_ok(&cmd).await
    }

    async fn host_port(&self, container_id: &str, container_port: u16) -> Result<u16> {
        let output = self
            .exec_ok(&args(["port", container_id, &format!("{}/tcp", container_port)]))
            .await?;

        parse_port_line(&output).ok_or_else(|| {
            Error::Internal(format!(
                "No host port published for {}:{} ({})",
                container_id, container_port, output
            ))
        })
    }

    async fn is_running(&self, container_id: &str) -> Result<bool> {
        let output = self
            .exec_ok(&args(["inspect", "-f", "{{.State.Running}}", container_id]))
            .await?;
        Ok(output == "true")
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.exec_ok(&args(["start", container_id])).await.map(|_| ())
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.exec_ok(&args(["stop", container_id])).await.map(|_| ())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.exec_ok(&args(["rm", "-f", container_id])).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_line() {
        assert_eq!(parse_port_line("127.0.0.1:49153"), Some(49153));
        assert_eq!(parse_port_line("0.0.0.0:32768\n[::]:32768"), Some(32768));
        assert_eq!(parse_port_line(""), None);
        assert_eq!(parse_port_line("garbage"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_error() {
        let cli = DockerCli::new("definitely-not-docker-12345", Duration::from_secs(1));
        let result = cli.is_running("abc").await;
        assert!(matches!(result, Err(Error::Internal(_))));
    }
}
