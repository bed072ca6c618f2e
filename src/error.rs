use thiserror::Error;

use crate::coordinator::CoordinatorError;
use crate::logs::LogStoreError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum LabqueueError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Log store error: {0}")]
    LogStore(#[from] LogStoreError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LabqueueError>;
