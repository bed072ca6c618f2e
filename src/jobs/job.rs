use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Container environment as submitted: string keys, arbitrary JSON values.
pub type Environment = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Enqueued,
    Running,
    Finished,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Enqueued => "ENQUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Cancelled)
    }

    /// Checks a status requested through an update call.
    ///
    /// `ENQUEUED -> RUNNING` is reserved for the claim, so the only changes an
    /// update may make are `RUNNING -> FINISHED` and `RUNNING -> CANCELLED`.
    /// Re-asserting the current status of a live job is a no-op; a terminal
    /// job never accepts another status.
    pub fn check_update(self, next: JobStatus) -> Result<(), InvalidTransition> {
        let allowed = !self.is_terminal()
            && (self == next || (self == JobStatus::Running && next.is_terminal()));

        if allowed {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENQUEUED" => Ok(JobStatus::Enqueued),
            "RUNNING" => Ok(JobStatus::Running),
            "FINISHED" => Ok(JobStatus::Finished),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot move job from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerSpec {
    pub image: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub environment: Environment,
}

/// What a client submits. Immutable once the job exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub docker: DockerSpec,
    #[serde(default)]
    pub metadata: Value,
}

impl JobSpec {
    pub fn new(image: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            docker: DockerSpec {
                image: image.into(),
                command: command.into(),
                environment: Environment::new(),
            },
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.docker.environment.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub docker: DockerSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    pub metadata: Value,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self::with_id(Uuid::new_v4(), spec, Utc::now())
    }

    pub fn with_id(id: Uuid, spec: JobSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: spec.name,
            description: spec.description,
            docker: spec.docker,
            created_at,
            updated_at: created_at,
            status: JobStatus::Enqueued,
            metadata: spec.metadata,
        }
    }

    pub fn spec(&self) -> JobSpec {
        JobSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            docker: self.docker.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Merge `patch` into this job. Absent fields are left untouched.
    pub fn apply(&mut self, patch: &JobPatch) -> Result<(), InvalidTransition> {
        if let Some(status) = patch.status {
            self.status.check_update(status)?;
            self.status = status;
        }
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(metadata) = &patch.metadata {
            self.metadata = metadata.clone();
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Merge-patch for `Update`. Empty strings count as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default, deserialize_with = "non_empty_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "non_empty_status")]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.metadata.is_none()
    }

    /// Drop empty strings so every backend sees the same patch.
    pub fn normalized(mut self) -> Self {
        self.name = self.name.filter(|s| !s.is_empty());
        self.description = self.description.filter(|s| !s.is_empty());
        self.metadata = self.metadata.filter(|v| !v.is_null());
        self
    }
}

fn non_empty_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

fn non_empty_status<'de, D>(deserializer: D) -> Result<Option<JobStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(json!(JobStatus::Cancelled), json!("CANCELLED"));
        assert_eq!("RUNNING".parse::<JobStatus>(), Ok(JobStatus::Running));
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn update_transitions() {
        use JobStatus::*;
        assert!(Running.check_update(Finished).is_ok());
        assert!(Running.check_update(Cancelled).is_ok());
        assert!(Running.check_update(Running).is_ok());
        assert!(Enqueued.check_update(Enqueued).is_ok());

        assert!(Enqueued.check_update(Running).is_err());
        assert!(Enqueued.check_update(Finished).is_err());
        assert!(Running.check_update(Enqueued).is_err());
        assert!(Finished.check_update(Finished).is_err());
        assert!(Finished.check_update(Cancelled).is_err());
        assert!(Cancelled.check_update(Running).is_err());
    }

    #[test]
    fn patch_treats_empty_strings_as_absent() {
        let patch: JobPatch = serde_json::from_value(json!({
            "name": "",
            "description": "new description",
            "status": "",
        }))
        .unwrap();

        assert_eq!(patch.name, None);
        assert_eq!(patch.description.as_deref(), Some("new description"));
        assert_eq!(patch.status, None);
        assert_eq!(patch.metadata, None);
    }

    #[test]
    fn apply_keeps_absent_fields() {
        let mut job = Job::new(JobSpec::new("alpine", "true").with_name("first"));
        job.status = JobStatus::Running;

        job.apply(&JobPatch {
            metadata: Some(json!({"epochs": 3})),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(job.name, "first");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.metadata, json!({"epochs": 3}));
    }

    #[test]
    fn spec_round_trips_through_job_json() {
        let body = json!({
            "name": "resnet",
            "description": "baseline",
            "docker": {
                "image": "pytorch/pytorch:2.1",
                "command": "python train.py",
                "environment": {"LR": 0.1, "TAG": "a"}
            },
            "metadata": {"owner": "lab"}
        });
        let spec: JobSpec = serde_json::from_value(body).unwrap();
        let job = Job::new(spec.clone());

        let encoded = serde_json::to_value(&job).unwrap();
        assert_eq!(encoded["status"], "ENQUEUED");
        assert_eq!(encoded["docker"]["environment"]["LR"], json!(0.1));

        let decoded: Job = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.spec(), spec);
    }
}
