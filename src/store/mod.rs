//! Durable job table with an atomic claim.
//!
//! Every backend must satisfy the same contract: `fetch_job` hands each
//! ENQUEUED job to at most one caller and flips it to RUNNING in the same
//! step. The conformance suite in `tests/store_tests.rs` runs against each
//! implementation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::{InvalidTransition, Job, JobPatch, JobSpec};

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl StoreError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        StoreError::Storage(err.to_string())
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job with status ENQUEUED.
    async fn insert(&self, spec: JobSpec) -> Result<Job, StoreError>;

    /// Atomically claim the oldest ENQUEUED job, moving it to RUNNING.
    ///
    /// `Ok(None)` means the queue is empty; it is not an error.
    async fn fetch_job(&self) -> Result<Option<Job>, StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Merge-patch a job. Fields absent from `patch` keep their value.
    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError>;

    /// All jobs, least recently updated first.
    async fn list_all(&self) -> Result<Vec<Job>, StoreError>;

    async fn close(&self);
}
