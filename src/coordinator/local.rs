use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::coordinator::{Coordinator, CoordinatorError};
use crate::jobs::{Job, JobPatch, JobStatus};
use crate::logs::{FileLogStore, LogAppender, LogConnector, LogError, LogTransport};
use crate::store::JobStore;

/// Coordinator backed directly by a store and log directory.
#[derive(Clone)]
pub struct LocalCoordinator {
    store: Arc<dyn JobStore>,
    logs: FileLogStore,
}

impl LocalCoordinator {
    pub fn new(store: Arc<dyn JobStore>, logs: FileLogStore) -> Self {
        Self { store, logs }
    }
}

#[async_trait]
impl Coordinator for LocalCoordinator {
    async fn poll_job(&self) -> Result<Option<Job>, CoordinatorError> {
        Ok(self.store.fetch_job().await?)
    }

    async fn report_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> Result<Job, CoordinatorError> {
        Ok(self.store.update(job_id, JobPatch::status(status)).await?)
    }
}

#[async_trait]
impl LogConnector for LocalCoordinator {
    async fn connect(&self, job_id: Uuid) -> Result<Box<dyn LogTransport>, LogError> {
        let appender = self
            .logs
            .appender(job_id)
            .await
            .map_err(|e| LogError::Transport(e.to_string()))?;
        Ok(Box::new(FileLogTransport { appender }))
    }
}

struct FileLogTransport {
    appender: LogAppender,
}

#[async_trait]
impl LogTransport for FileLogTransport {
    async fn send(&mut self, chunk: Bytes) -> Result<(), LogError> {
        self.appender
            .append(&chunk)
            .await
            .map_err(|e| LogError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), LogError> {
        Ok(())
    }
}
