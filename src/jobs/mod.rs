pub mod job;

pub use job::{DockerSpec, Environment, InvalidTransition, Job, JobPatch, JobSpec, JobStatus};
