use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;
use crate::jobs::Job;

/// A claimed job on its way to a slot. The permit marks the slot busy until
/// the job is done.
pub struct Dispatch {
    pub job: Job,
    pub permit: OwnedSemaphorePermit,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollerStats {
    pub ticks: u64,
    pub skipped_busy: u64,
    pub empty: u64,
    pub errors: u64,
    pub dispatched: u64,
}

/// Claims one job per tick while at least one slot is idle.
pub struct Poller {
    coordinator: Arc<dyn Coordinator>,
    interval: Duration,
    idle_slots: Arc<Semaphore>,
    handoff: mpsc::Sender<Dispatch>,
}

impl Poller {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        interval: Duration,
        idle_slots: Arc<Semaphore>,
        handoff: mpsc::Sender<Dispatch>,
    ) -> Self {
        Self {
            coordinator,
            interval,
            idle_slots,
            handoff,
        }
    }

    /// Run until `shutdown` fires. A claim already in flight is still handed
    /// off, so no claimed job is dropped. Returning drops the handoff sender,
    /// which lets idle slots exit.
    pub async fn run(self, shutdown: CancellationToken) -> PollerStats {
        let mut stats = PollerStats::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            stats.ticks += 1;

            let Ok(permit) = self.idle_slots.clone().try_acquire_owned() else {
                stats.skipped_busy += 1;
                tracing::trace!("All worker slots busy, skipping poll");
                continue;
            };

            match self.coordinator.poll_job().await {
                Ok(Some(job)) => {
                    tracing::info!(job_id = %job.id, "Claimed job");
                    if self.handoff.send(Dispatch { job, permit }).await.is_err() {
                        tracing::error!("All worker slots have stopped, poller exiting");
                        break;
                    }
                    stats.dispatched += 1;
                }
                Ok(None) => {
                    stats.empty += 1;
                    tracing::trace!("No job available");
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(error = %e, "Polling for jobs failed");
                }
            }
        }

        tracing::info!(dispatched = stats.dispatched, "Poller stopped");
        stats
    }
}
