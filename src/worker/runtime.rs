use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;

use crate::config::ContainerConfig;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container create failed: {0}")]
    Create(String),

    #[error("container start failed: {0}")]
    Start(String),

    #[error("container logs failed: {0}")]
    Logs(String),

    #[error("container wait failed: {0}")]
    Wait(String),

    #[error("container remove failed: {0}")]
    Remove(String),

    #[error("container runtime unreachable: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to create one job container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub gpus: Vec<String>,
    pub labels: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    pub id: String,
    pub warnings: Vec<String>,
}

/// Combined stdout and stderr of a container, in the order the runtime emits it.
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<Bytes, RuntimeError>> + Send>>;

/// The container operations the execution engine relies on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Follow the container's output until it stops.
    async fn logs(&self, id: &str) -> Result<OutputStream, RuntimeError>;

    /// Block until the container is no longer running; returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Force-remove the container, killing it if still running.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Drives containers through the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    config: ContainerConfig,
}

impl DockerCli {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    /// Arguments for `docker create`.
    pub fn create_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["create".to_string()];

        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }

        if !spec.gpus.is_empty() {
            // The quotes keep docker's CSV parser from splitting the device list.
            args.push("--gpus".to_string());
            args.push(format!("\"device={}\"", spec.gpus.join(",")));
        }

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }

        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }

        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, RuntimeError> {
        let output = Command::new(&self.config.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer, RuntimeError> {
        let args = self.create_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&args).await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(RuntimeError::Create(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .ok_or_else(|| RuntimeError::Create("docker printed no container id".to_string()))?
            .to_string();

        // Pull progress and daemon warnings both arrive on stderr.
        let warnings = stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        Ok(CreatedContainer { id, warnings })
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let output = self.run(&["start", id]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Start(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn logs(&self, id: &str) -> Result<OutputStream, RuntimeError> {
        // Both pipes of `docker logs` share one socket so stdout and stderr
        // stay interleaved the way the container wrote them.
        let (reader, writer) = std::os::unix::net::UnixStream::pair()?;
        let writer_err = writer.try_clone()?;
        reader.set_nonblocking(true)?;
        let reader = tokio::net::UnixStream::from_std(reader)?;

        let mut child = {
            let mut command = Command::new(&self.config.docker_bin);
            command
                .args(["logs", "--follow", id])
                .stdin(Stdio::null())
                .stdout(Stdio::from(OwnedFd::from(writer)))
                .stderr(Stdio::from(OwnedFd::from(writer_err)))
                .kill_on_drop(true);
            command.spawn()?
        };

        let (tx, rx) = mpsc::channel(32);
        let container = id.to_string();
        tokio::spawn(async move {
            let mut chunks = ReaderStream::new(reader);
            while let Some(chunk) = chunks.next().await {
                let item = chunk.map_err(|e| RuntimeError::Logs(e.to_string()));
                if tx.send(item).await.is_err() {
                    break;
                }
            }

            match child.wait().await {
                Ok(status) if !status.success() => {
                    tracing::warn!(container = %container, status = %status, "docker logs exited with failure");
                    let _ = tx
                        .send(Err(RuntimeError::Logs(format!("docker logs exited with {status}"))))
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(container = %container, error = %e, "Failed to reap docker logs");
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let output = self.run(&["wait", id]).await?;
        if !output.status.success() {
            return Err(RuntimeError::Wait(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<i64>()
            .map_err(|e| RuntimeError::Wait(format!("unexpected exit code {stdout:?}: {e}")))
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let output = self.run(&["rm", "--force", id]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Remove(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "pytorch/pytorch:2.1".to_string(),
            command: vec!["python".to_string(), "train.py".to_string()],
            env: vec![("LR".to_string(), "0.1".to_string())],
            gpus: vec!["0".to_string(), "1".to_string()],
            labels: vec![("labqueue.job".to_string(), "abc".to_string())],
        }
    }

    #[test]
    fn create_args_with_gpus_and_limits() {
        let cli = DockerCli::new(ContainerConfig {
            network_disabled: true,
            memory_limit: Some("8g".to_string()),
            cpu_limit: Some("4".to_string()),
            ..Default::default()
        });

        let args = cli.create_args(&spec());
        assert_eq!(
            args,
            vec![
                "create",
                "--label",
                "labqueue.job=abc",
                "--gpus",
                "\"device=0,1\"",
                "--network=none",
                "--memory=8g",
                "--cpus=4",
                "-e",
                "LR=0.1",
                "pytorch/pytorch:2.1",
                "python",
                "train.py",
            ]
        );
    }

    #[test]
    fn create_args_without_gpus_skips_device_request() {
        let cli = DockerCli::new(ContainerConfig::default());
        let mut spec = spec();
        spec.gpus.clear();

        let args = cli.create_args(&spec);
        assert!(!args.iter().any(|a| a == "--gpus"));
        assert_eq!(args.last().map(String::as_str), Some("train.py"));
    }
}
