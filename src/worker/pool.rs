use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{ContainerConfig, LogWriterConfig, SlotConfig, WorkerConfig};
use crate::coordinator::{Coordinator, CoordinatorError, GrpcCoordinator};
use crate::logs::LogConnector;
use crate::jobs::JobStatus;
use crate::worker::executor::{ExecutionResult, JobExecutor};
use crate::worker::poller::{Dispatch, Poller, PollerStats};
use crate::worker::runtime::{ContainerRuntime, DockerCli};

/// Job outcomes counted by one or more slots.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JobCounts {
    pub finished: u64,
    pub cancelled: u64,
    /// Jobs whose terminal status never reached the coordinator
    pub unreported: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.finished + self.cancelled
    }

    fn record(&mut self, result: &ExecutionResult) {
        match result.status {
            JobStatus::Finished => self.finished += 1,
            _ => self.cancelled += 1,
        }
        if !result.reported {
            self.unreported += 1;
        }
    }

    fn add(&mut self, other: JobCounts) {
        self.finished += other.finished;
        self.cancelled += other.cancelled;
        self.unreported += other.unreported;
    }
}

/// What a pool did before it shut down.
#[derive(Debug, Default)]
pub struct PoolReport {
    pub poller: PollerStats,
    pub jobs: JobCounts,
}

/// A poller plus one task per worker slot.
///
/// The handoff channel holds as many jobs as there are slots, and a job is
/// only claimed after reserving an idle slot, so a send never waits on a
/// busy pool.
pub struct WorkerPool {
    executors: Vec<JobExecutor>,
    coordinator: Arc<dyn Coordinator>,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        executors: Vec<JobExecutor>,
        coordinator: Arc<dyn Coordinator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            executors,
            coordinator,
            poll_interval,
        }
    }

    /// One executor per slot, all sharing the same runtime and coordinator.
    pub fn for_slots(
        slots: &[SlotConfig],
        container: &ContainerConfig,
        log_writer: &LogWriterConfig,
        poll_interval: Duration,
        runtime: Arc<dyn ContainerRuntime>,
        coordinator: Arc<dyn Coordinator>,
        logs: Arc<dyn LogConnector>,
    ) -> Self {
        let executors = slots
            .iter()
            .map(|slot| {
                JobExecutor::new(
                    slot.clone(),
                    runtime.clone(),
                    coordinator.clone(),
                    logs.clone(),
                )
                .with_log_writer(log_writer.clone())
                .with_remove_after_exit(container.remove_after_exit)
            })
            .collect();

        Self::new(executors, coordinator, poll_interval)
    }

    /// Poll and execute until `shutdown` fires, then wait for every slot to
    /// finish its current job.
    pub async fn run(self, shutdown: CancellationToken) -> PoolReport {
        let slots = self.executors.len().max(1);
        let idle_slots = Arc::new(Semaphore::new(self.executors.len()));
        let (tx, rx) = mpsc::channel::<Dispatch>(slots);
        let rx = Arc::new(Mutex::new(rx));

        let mut tasks = JoinSet::new();
        for executor in self.executors {
            tasks.spawn(slot_loop(executor, rx.clone()));
        }

        tracing::info!(slots = tasks.len(), "Worker pool started");

        let poller = Poller::new(self.coordinator, self.poll_interval, idle_slots, tx);
        let poller_stats = poller.run(shutdown).await;

        tracing::info!("Waiting for in-flight jobs to finish");
        let mut jobs = JobCounts::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(counts) => jobs.add(counts),
                Err(e) => tracing::error!(error = %e, "Worker slot task failed"),
            }
        }

        tracing::info!(
            finished = jobs.finished,
            cancelled = jobs.cancelled,
            unreported = jobs.unreported,
            "Worker pool stopped"
        );
        PoolReport {
            poller: poller_stats,
            jobs,
        }
    }
}

/// Run a standalone worker against a remote server until `shutdown` fires.
pub async fn run_worker(
    config: WorkerConfig,
    shutdown: CancellationToken,
) -> Result<PoolReport, CoordinatorError> {
    let coordinator = Arc::new(GrpcCoordinator::connect_lazy(
        &config.server_url,
        &config.token,
        config.name.clone(),
    )?);

    tracing::info!(
        server = %config.server_url,
        worker = %config.name,
        slots = config.slots.len(),
        "Starting labqueue worker"
    );

    let pool = WorkerPool::for_slots(
        &config.slots,
        &config.container,
        &config.log_writer,
        config.poll_interval,
        Arc::new(DockerCli::new(config.container.clone())),
        coordinator.clone(),
        coordinator,
    );
    Ok(pool.run(shutdown).await)
}

async fn slot_loop(
    executor: JobExecutor,
    rx: Arc<Mutex<mpsc::Receiver<Dispatch>>>,
) -> JobCounts {
    let slot = executor.slot().id;
    let mut counts = JobCounts::default();

    loop {
        let next = rx.lock().await.recv().await;
        let Some(Dispatch { job, permit }) = next else {
            break;
        };

        tracing::debug!(slot, job_id = %job.id, "Slot picked up job");
        let result = executor.execute(job).await;
        drop(permit);

        tracing::debug!(
            slot,
            job_id = %result.job_id,
            status = %result.status,
            error = ?result.error,
            "Slot finished job"
        );
        counts.record(&result);
    }

    tracing::debug!(slot, "Worker slot stopped");
    counts
}
