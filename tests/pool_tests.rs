
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use labqueue::config::{ContainerConfig, LogWriterConfig, SlotConfig};
use labqueue::coordinator::LocalCoordinator;
use labqueue::jobs::{JobSpec, JobStatus};
use labqueue::store::{JobStore, MemoryJobStore};
use labqueue::worker::{JobCounts, JobExecutor, Poller, WorkerPool};
use test_harness::{
    hello_job, temp_log_store, wait_until, FakeRuntime, MemoryLog, RecordingCoordinator, Script,
};

const POLL: Duration = Duration::from_millis(10);

fn fast_writer() -> LogWriterConfig {
    LogWriterConfig {
        flush_interval: Duration::from_millis(10),
        ..LogWriterConfig::default()
    }
}

fn pool(slots: usize, runtime: &FakeRuntime, coordinator: &RecordingCoordinator) -> WorkerPool {
    let slots: Vec<SlotConfig> = (0..slots).map(|id| SlotConfig::new(id, Vec::new())).collect();
    WorkerPool::for_slots(
        &slots,
        &ContainerConfig::default(),
        &fast_writer(),
        POLL,
        Arc::new(runtime.clone()),
        Arc::new(coordinator.clone()),
        Arc::new(MemoryLog::new()),
    )
}

// =============================================================================
// Poller
// =============================================================================

#[tokio::test]
async fn test_poller_skips_when_no_slot_is_idle() {
    let coordinator = RecordingCoordinator::new();
    coordinator.enqueue(hello_job());
    let (tx, _rx) = mpsc::channel(1);
    let poller = Poller::new(
        Arc::new(coordinator.clone()),
        POLL,
        Arc::new(Semaphore::new(0)),
        tx,
    );

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(poller.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    let stats = handle.await.unwrap();

    assert!(stats.ticks > 0);
    assert_eq!(stats.skipped_busy, stats.ticks);
    assert_eq!(stats.dispatched, 0);
    assert_eq!(coordinator.polls(), 0);
}

#[tokio::test]
async fn test_poller_hands_off_with_slot_permit() {
    let coordinator = RecordingCoordinator::new();
    let job = hello_job();
    coordinator.enqueue(job.clone());
    let idle = Arc::new(Semaphore::new(1));
    let (tx, mut rx) = mpsc::channel(1);
    let poller = Poller::new(Arc::new(coordinator.clone()), POLL, idle.clone(), tx);

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(poller.run(shutdown.clone()));

    let dispatch = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dispatch.job.id, job.id);
    assert_eq!(dispatch.job.status, JobStatus::Running);

    // The slot stays reserved while the dispatch is held
    assert_eq!(idle.available_permits(), 0);
    drop(dispatch);
    assert_eq!(idle.available_permits(), 1);

    shutdown.cancel();
    let stats = handle.await.unwrap();
    assert_eq!(stats.dispatched, 1);
}

#[tokio::test]
async fn test_poller_survives_coordinator_errors() {
    let coordinator = RecordingCoordinator::unavailable();
    let (tx, _rx) = mpsc::channel(1);
    let poller = Poller::new(
        Arc::new(coordinator.clone()),
        POLL,
        Arc::new(Semaphore::new(1)),
        tx,
    );

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(poller.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    let stats = handle.await.unwrap();

    assert!(stats.errors >= 2);
    assert_eq!(stats.errors as usize, coordinator.polls());
}

// =============================================================================
// Pool
// =============================================================================

#[tokio::test]
async fn test_pool_runs_every_queued_job() {
    let runtime = FakeRuntime::new(Script::printing(&["hi\n"]));
    let coordinator = RecordingCoordinator::new();
    for _ in 0..3 {
        coordinator.enqueue(hello_job());
    }

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(pool(2, &runtime, &coordinator).run(shutdown.clone()));

    let done = wait_until(Duration::from_secs(5), || {
        let coordinator = coordinator.clone();
        async move { coordinator.reports().len() == 3 }
    })
    .await;
    assert!(done, "not every job was reported");

    shutdown.cancel();
    let report = handle.await.unwrap();
    assert_eq!(report.poller.dispatched, 3);
    assert_eq!(
        report.jobs,
        JobCounts {
            finished: 3,
            cancelled: 0,
            unreported: 0,
        }
    );
    assert!(coordinator
        .reports()
        .iter()
        .all(|(_, status)| *status == JobStatus::Finished));
}

#[tokio::test]
async fn test_slot_is_reused_after_cancelled_job() {
    let runtime = FakeRuntime::new(Script {
        create_error: Some("pull access denied".to_string()),
        ..Default::default()
    });
    let coordinator = RecordingCoordinator::new();
    coordinator.enqueue(hello_job());
    coordinator.enqueue(hello_job());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(pool(1, &runtime, &coordinator).run(shutdown.clone()));

    let done = wait_until(Duration::from_secs(5), || {
        let coordinator = coordinator.clone();
        async move { coordinator.reports().len() == 2 }
    })
    .await;
    assert!(done);

    shutdown.cancel();
    let report = handle.await.unwrap();
    assert_eq!(report.jobs.cancelled, 2);
    assert_eq!(report.jobs.total(), 2);
}

#[tokio::test]
async fn test_shutdown_waits_for_running_job() {
    let runtime = FakeRuntime::new(Script {
        output: vec!["training...\n"],
        run_for: Duration::from_millis(300),
        ..Default::default()
    });
    let coordinator = RecordingCoordinator::new();
    coordinator.enqueue(hello_job());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(pool(1, &runtime, &coordinator).run(shutdown.clone()));

    let started = wait_until(Duration::from_secs(5), || {
        let runtime = runtime.clone();
        async move { !runtime.started().is_empty() }
    })
    .await;
    assert!(started);

    shutdown.cancel();
    let report = handle.await.unwrap();

    assert_eq!(report.jobs.finished, 1);
    assert_eq!(report.jobs.total(), 1);
    assert_eq!(coordinator.reports().len(), 1);
}

#[tokio::test]
async fn test_end_to_end_with_local_coordinator() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let (_dir, logs) = temp_log_store().await;
    let local = Arc::new(LocalCoordinator::new(store.clone(), logs.clone()));
    let runtime = FakeRuntime::new(Script::printing(&[
        "\nHello from Docker!\n",
        "This message shows that your installation appears to be working correctly.\n",
    ]));

    let job = store
        .insert(JobSpec::new("hello-world", "").with_name("smoke"))
        .await
        .unwrap();
    let job_id = job.id;

    let executor = JobExecutor::new(
        SlotConfig::default(),
        Arc::new(runtime.clone()),
        local.clone(),
        local.clone(),
    )
    .with_log_writer(fast_writer());
    let pool = WorkerPool::new(vec![executor], local, POLL);

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(pool.run(shutdown.clone()));

    let finished = wait_until(Duration::from_secs(5), || {
        let store = store.clone();
        async move {
            matches!(
                store.get_by_id(job_id).await,
                Ok(Some(j)) if j.status == JobStatus::Finished
            )
        }
    })
    .await;
    assert!(finished, "job never reached FINISHED");

    shutdown.cancel();
    handle.await.unwrap();

    let log = logs.read_all(job_id).await.unwrap();
    let log = String::from_utf8_lossy(&log);
    assert!(log.contains("Hello from Docker!"));
    assert!(!log.contains("end-of-stream"));
    assert!(runtime.created()[0].command.is_empty());
}
