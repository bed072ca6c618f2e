use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{LogWriterConfig, SlotConfig};
use crate::coordinator::Coordinator;
use crate::jobs::{Job, JobStatus};
use crate::logs::{LogConnector, LogWriter};
use crate::worker::runtime::{ContainerRuntime, ContainerSpec, OutputStream, RuntimeError};

pub const ENV_JOB_ID: &str = "LABQUEUE_JOB_ID";
pub const ENV_JOB_NAME: &str = "LABQUEUE_JOB_NAME";
pub const ENV_JOB_DESCRIPTION: &str = "LABQUEUE_JOB_DESCRIPTION";
pub const ENV_IMAGE: &str = "LABQUEUE_IMAGE";
pub const ENV_COMMAND: &str = "LABQUEUE_COMMAND";
pub const ENV_GPUS: &str = "LABQUEUE_GPUS";

/// Where a job is in its run on this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Claimed,
    ContainerCreating,
    ContainerRunning,
    LogDraining,
    Terminal(JobStatus),
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionState::Claimed => write!(f, "claimed"),
            ExecutionState::ContainerCreating => write!(f, "container_creating"),
            ExecutionState::ContainerRunning => write!(f, "container_running"),
            ExecutionState::LogDraining => write!(f, "log_draining"),
            ExecutionState::Terminal(status) => write!(f, "terminal({status})"),
        }
    }
}

/// Result of job execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    /// States visited, in order
    pub states: Vec<ExecutionState>,
    /// Whether the status report reached the coordinator
    pub reported: bool,
}

struct Run {
    job_id: Uuid,
    states: Vec<ExecutionState>,
}

impl Run {
    fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            states: vec![ExecutionState::Claimed],
        }
    }

    fn enter(&mut self, next: ExecutionState) {
        let from = self.states.last().copied().unwrap_or(ExecutionState::Claimed);
        tracing::debug!(job_id = %self.job_id, from = %from, to = %next, "Job state change");
        self.states.push(next);
    }
}

/// Runs claimed jobs to completion inside one worker slot.
///
/// Each job goes CLAIMED -> CONTAINER_CREATING -> CONTAINER_RUNNING ->
/// LOG_DRAINING -> TERMINAL. Creation and start failures skip straight to
/// TERMINAL(CANCELLED). Whatever the path, the log is closed with the
/// end-of-stream marker before the one and only status report.
#[derive(Clone)]
pub struct JobExecutor {
    slot: SlotConfig,
    runtime: Arc<dyn ContainerRuntime>,
    coordinator: Arc<dyn Coordinator>,
    logs: Arc<dyn LogConnector>,
    log_writer: LogWriterConfig,
    remove_after_exit: bool,
}

impl JobExecutor {
    pub fn new(
        slot: SlotConfig,
        runtime: Arc<dyn ContainerRuntime>,
        coordinator: Arc<dyn Coordinator>,
        logs: Arc<dyn LogConnector>,
    ) -> Self {
        Self {
            slot,
            runtime,
            coordinator,
            logs,
            log_writer: LogWriterConfig::default(),
            remove_after_exit: true,
        }
    }

    pub fn with_log_writer(mut self, config: LogWriterConfig) -> Self {
        self.log_writer = config;
        self
    }

    pub fn with_remove_after_exit(mut self, remove: bool) -> Self {
        self.remove_after_exit = remove;
        self
    }

    pub fn slot(&self) -> &SlotConfig {
        &self.slot
    }

    /// Run a claimed job and report its terminal status.
    pub async fn execute(&self, job: Job) -> ExecutionResult {
        let span = tracing::info_span!("job", job_id = %job.id, slot = self.slot.id);
        self.execute_inner(job).instrument(span).await
    }

    async fn execute_inner(&self, job: Job) -> ExecutionResult {
        tracing::info!(image = %job.docker.image, command = %job.docker.command, "Executing job");
        let mut run = Run::new(job.id);

        let (status, exit_code, error) =
            match LogWriter::open(job.id, self.logs.clone(), self.log_writer.clone()).await {
                Ok(writer) => {
                    let outcome = self.run_container(&job, &writer, &mut run).await;
                    if let Err(e) = writer.close().await {
                        tracing::warn!(error = %e, "Failed to close job log");
                    }
                    match outcome {
                        Ok(code) => (JobStatus::Finished, Some(code), None),
                        Err(e) => (JobStatus::Cancelled, None, Some(e.to_string())),
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to open job log");
                    (JobStatus::Cancelled, None, Some(e.to_string()))
                }
            };

        run.enter(ExecutionState::Terminal(status));

        let reported = match self.coordinator.report_status(job.id, status).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(status = %status, error = %e, "Failed to report job status");
                false
            }
        };

        tracing::info!(status = %status, exit_code = ?exit_code, "Job completed");

        ExecutionResult {
            job_id: job.id,
            status,
            exit_code,
            error,
            states: run.states,
            reported,
        }
    }

    async fn run_container(
        &self,
        job: &Job,
        writer: &LogWriter,
        run: &mut Run,
    ) -> Result<i64, RuntimeError> {
        run.enter(ExecutionState::ContainerCreating);

        let spec = container_spec(job, &self.slot.gpus);
        let created = match self.runtime.create(&spec).await {
            Ok(created) => created,
            Err(e) => {
                tracing::warn!(error = %e, "Container creation failed");
                let _ = writer.write_line(&format!("[labqueue] {e}")).await;
                return Err(e);
            }
        };
        let container = created.id;

        for warning in &created.warnings {
            let _ = writer
                .write_line(&format!("[container warning] {warning}"))
                .await;
        }

        if let Err(e) = self.runtime.start(&container).await {
            tracing::warn!(container = %container, error = %e, "Container start failed");
            let _ = writer.write_line(&format!("[labqueue] {e}")).await;
            self.remove(&container).await;
            return Err(e);
        }
        run.enter(ExecutionState::ContainerRunning);

        let output = match self.runtime.logs(&container).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(container = %container, error = %e, "Attaching to container output failed");
                let _ = writer.write_line(&format!("[labqueue] {e}")).await;
                self.remove(&container).await;
                return Err(e);
            }
        };

        let copy = tokio::spawn(
            copy_output(output, writer.clone()).instrument(tracing::Span::current()),
        );

        let exit = self.runtime.wait(&container).await;
        run.enter(ExecutionState::LogDraining);

        // A container we could not wait on may still be running; removing it
        // is what ends its output stream.
        if let Err(e) = &exit {
            tracing::warn!(container = %container, error = %e, "Waiting for container failed");
            self.remove(&container).await;
        }

        match copy.await {
            Ok(copied) => tracing::debug!(container = %container, bytes = copied, "Container output drained"),
            Err(e) => tracing::warn!(container = %container, error = %e, "Output copy task failed"),
        }

        if let Ok(code) = &exit {
            tracing::info!(container = %container, exit_code = code, "Container stopped");
            if self.remove_after_exit {
                self.remove(&container).await;
            }
        }

        exit
    }

    async fn remove(&self, container: &str) {
        if let Err(e) = self.runtime.remove(container).await {
            tracing::warn!(container = %container, error = %e, "Failed to remove container");
        }
    }
}

/// Copy container output into the job log until the runtime closes it.
async fn copy_output(mut output: OutputStream, writer: LogWriter) -> u64 {
    let mut copied = 0u64;
    let mut lost = false;

    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(bytes) => {
                copied += bytes.len() as u64;
                // Keep draining after a lost transport so the container is
                // never blocked on a full pipe.
                if let Err(e) = writer.write(&bytes).await {
                    if !lost {
                        tracing::warn!(error = %e, "Dropping container output");
                        lost = true;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reading container output failed");
                break;
            }
        }
    }

    copied
}

/// Build the container request for `job`.
///
/// The job's own environment is copied, then the identity variables are laid
/// over it, so injected keys win on collision. The job itself is untouched.
pub fn container_spec(job: &Job, gpus: &[String]) -> ContainerSpec {
    ContainerSpec {
        image: job.docker.image.clone(),
        command: job
            .docker
            .command
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        env: container_env(job, gpus).into_iter().collect(),
        gpus: gpus.to_vec(),
        labels: vec![("labqueue.job".to_string(), job.id.to_string())],
    }
}

pub fn container_env(job: &Job, gpus: &[String]) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = job
        .docker
        .environment
        .iter()
        .map(|(key, value)| (key.clone(), env_value(value)))
        .collect();

    env.insert(ENV_JOB_ID.to_string(), job.id.to_string());
    env.insert(ENV_JOB_NAME.to_string(), job.name.clone());
    env.insert(ENV_JOB_DESCRIPTION.to_string(), job.description.clone());
    env.insert(ENV_IMAGE.to_string(), job.docker.image.clone());
    env.insert(ENV_COMMAND.to_string(), job.docker.command.clone());
    env.insert(ENV_GPUS.to_string(), gpus.join(","));
    env
}

fn env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobSpec;
    use serde_json::json;

    #[test]
    fn injected_variables_override_job_environment() {
        let job = Job::new(
            JobSpec::new("alpine", "echo hi")
                .with_name("sweep")
                .with_env("LABQUEUE_JOB_NAME", "spoofed")
                .with_env("BATCH", 64)
                .with_env("TAG", "a"),
        );

        let env = container_env(&job, &["2".to_string(), "3".to_string()]);

        assert_eq!(env["LABQUEUE_JOB_NAME"], "sweep");
        assert_eq!(env["LABQUEUE_JOB_ID"], job.id.to_string());
        assert_eq!(env["LABQUEUE_GPUS"], "2,3");
        assert_eq!(env["LABQUEUE_COMMAND"], "echo hi");
        assert_eq!(env["BATCH"], "64");
        assert_eq!(env["TAG"], "a");
        assert_eq!(
            job.docker.environment.get("LABQUEUE_JOB_NAME"),
            Some(&json!("spoofed"))
        );
    }

    #[test]
    fn command_is_split_on_whitespace() {
        let job = Job::new(JobSpec::new("alpine", "  python  train.py --lr 0.1 "));
        let spec = container_spec(&job, &[]);
        assert_eq!(spec.command, vec!["python", "train.py", "--lr", "0.1"]);
        assert!(spec.gpus.is_empty());
        assert_eq!(spec.image, "alpine");
    }
}
