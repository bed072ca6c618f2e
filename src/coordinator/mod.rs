//! The API boundary as a worker sees it.
//!
//! [`GrpcCoordinator`] talks to a remote server; [`LocalCoordinator`] calls a
//! store and log directory in the same process (embedded worker slots and
//! tests).

pub mod grpc;
pub mod local;

use async_trait::async_trait;
use thiserror::Error;
use tonic::Code;
use uuid::Uuid;

use crate::jobs::{Job, JobStatus};
use crate::store::StoreError;

pub use grpc::GrpcCoordinator;
pub use local::LocalCoordinator;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("invalid worker token")]
    InvalidToken,
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Storage(msg) => CoordinatorError::Unavailable(msg),
            StoreError::NotFound(id) => CoordinatorError::NotFound(id.to_string()),
            StoreError::InvalidTransition(e) => CoordinatorError::Rejected(e.to_string()),
        }
    }
}

impl From<tonic::Status> for CoordinatorError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::NotFound => CoordinatorError::NotFound(message),
            Code::FailedPrecondition | Code::InvalidArgument | Code::Unauthenticated => {
                CoordinatorError::Rejected(message)
            }
            _ => CoordinatorError::Unavailable(format!("{}: {}", status.code(), message)),
        }
    }
}

/// Job claims and status reports on behalf of a worker.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Claim one job. `Ok(None)` means there is nothing to run.
    async fn poll_job(&self) -> Result<Option<Job>, CoordinatorError>;

    /// Report the final status of a job this worker ran.
    async fn report_status(&self, job_id: Uuid, status: JobStatus)
        -> Result<Job, CoordinatorError>;
}
