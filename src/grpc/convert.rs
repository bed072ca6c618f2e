use chrono::{DateTime, Utc};
use serde_json::Value;
use tonic::Status;
use uuid::Uuid;

use crate::jobs::{DockerSpec, Environment, Job, JobStatus};
use crate::proto::{Job as ProtoJob, JobStatus as ProtoJobStatus};

pub fn status_to_proto(status: JobStatus) -> ProtoJobStatus {
    match status {
        JobStatus::Enqueued => ProtoJobStatus::Enqueued,
        JobStatus::Running => ProtoJobStatus::Running,
        JobStatus::Finished => ProtoJobStatus::Finished,
        JobStatus::Cancelled => ProtoJobStatus::Cancelled,
    }
}

/// `Ok(None)` for an unset status field.
pub fn status_from_proto(value: i32) -> Result<Option<JobStatus>, Status> {
    let status = ProtoJobStatus::try_from(value)
        .map_err(|_| Status::invalid_argument(format!("Unknown job status {value}")))?;

    Ok(match status {
        ProtoJobStatus::Unspecified => None,
        ProtoJobStatus::Enqueued => Some(JobStatus::Enqueued),
        ProtoJobStatus::Running => Some(JobStatus::Running),
        ProtoJobStatus::Finished => Some(JobStatus::Finished),
        ProtoJobStatus::Cancelled => Some(JobStatus::Cancelled),
    })
}

pub fn parse_job_id(id: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(id).map_err(|_| Status::invalid_argument("Invalid job ID"))
}

pub fn job_to_proto(job: &Job) -> ProtoJob {
    ProtoJob {
        id: job.id.to_string(),
        name: job.name.clone(),
        description: job.description.clone(),
        image: job.docker.image.clone(),
        command: job.docker.command.clone(),
        environment_json: Value::Object(job.docker.environment.clone()).to_string(),
        metadata_json: job.metadata.to_string(),
        status: status_to_proto(job.status) as i32,
        created_at_ms: job.created_at.timestamp_millis(),
        updated_at_ms: job.updated_at.timestamp_millis(),
    }
}

pub fn job_from_proto(proto: ProtoJob) -> Result<Job, Status> {
    let environment: Environment = if proto.environment_json.is_empty() {
        Environment::new()
    } else {
        serde_json::from_str(&proto.environment_json)
            .map_err(|e| Status::invalid_argument(format!("Invalid environment: {e}")))?
    };
    let metadata = parse_metadata(&proto.metadata_json)?;
    let status = status_from_proto(proto.status)?
        .ok_or_else(|| Status::invalid_argument("Job status missing"))?;

    Ok(Job {
        id: parse_job_id(&proto.id)?,
        name: proto.name,
        description: proto.description,
        docker: DockerSpec {
            image: proto.image,
            command: proto.command,
            environment,
        },
        created_at: timestamp(proto.created_at_ms)?,
        updated_at: timestamp(proto.updated_at_ms)?,
        status,
        metadata,
    })
}

pub fn parse_metadata(json: &str) -> Result<Value, Status> {
    if json.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(json).map_err(|e| Status::invalid_argument(format!("Invalid metadata: {e}")))
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, Status> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Status::invalid_argument(format!("Timestamp out of range: {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobSpec;
    use serde_json::json;

    #[test]
    fn job_survives_proto_conversion() {
        let mut spec = JobSpec::new("alpine", "echo hi").with_env("SEED", 7);
        spec.metadata = json!({"tags": ["a", "b"]});
        let job = Job::new(spec);

        let back = job_from_proto(job_to_proto(&job)).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.spec(), job.spec());
        assert_eq!(back.status, JobStatus::Enqueued);
        assert_eq!(
            back.created_at.timestamp_millis(),
            job.created_at.timestamp_millis()
        );
    }

    #[test]
    fn unspecified_status_is_absent() {
        assert_eq!(status_from_proto(0).unwrap(), None);
        assert_eq!(
            status_from_proto(ProtoJobStatus::Finished as i32).unwrap(),
            Some(JobStatus::Finished)
        );
        assert!(status_from_proto(99).is_err());
    }

    #[test]
    fn bad_job_id_is_invalid_argument() {
        let err = parse_job_id("not-a-uuid").unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
