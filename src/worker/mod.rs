//! Worker side of the scheduler.
//!
//! A [`WorkerPool`] runs one [`Poller`] and one task per configured slot. The
//! poller claims jobs through a [`Coordinator`](crate::coordinator::Coordinator)
//! when a slot is idle and hands them over a bounded channel; each slot runs
//! its jobs through a [`JobExecutor`], which drives a [`ContainerRuntime`].
//!
//! # Execution Flow
//!
//! 1. Poller ticks, reserves an idle slot and claims a job
//! 2. The slot's [`JobExecutor::execute`] creates and starts the container
//! 3. Container output is copied into the job log while waiting for exit
//! 4. The log is closed with the end-of-stream marker
//! 5. The terminal status is reported once

pub mod executor;
pub mod poller;
pub mod pool;
pub mod runtime;

pub use executor::{ExecutionResult, ExecutionState, JobExecutor};
pub use poller::{Dispatch, Poller, PollerStats};
pub use pool::{run_worker, JobCounts, PoolReport, WorkerPool};
pub use runtime::{ContainerRuntime, ContainerSpec, CreatedContainer, DockerCli, OutputStream, RuntimeError};
