use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::jobs::{Job, JobPatch, JobSpec, JobStatus};
use crate::store::{JobStore, StoreError};

#[derive(Debug)]
struct Entry {
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, Entry>,
    next_seq: u64,
}

/// In-process job table. Claims run under the write lock, so selecting and
/// flipping a job to RUNNING cannot interleave with another claim.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, spec: JobSpec) -> Result<Job, StoreError> {
        let job = Job::new(spec);
        let mut inner = self.inner.write().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            job.id,
            Entry {
                seq,
                job: job.clone(),
            },
        );
        Ok(job)
    }

    async fn fetch_job(&self) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.write().await;
        let oldest = inner
            .jobs
            .values()
            .filter(|e| e.job.status == JobStatus::Enqueued)
            .min_by_key(|e| (e.job.created_at, e.seq))
            .map(|e| e.job.id);

        let Some(id) = oldest else {
            return Ok(None);
        };
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        entry.job.status = JobStatus::Running;
        entry.job.updated_at = chrono::Utc::now();
        Ok(Some(entry.job.clone()))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.read().await.jobs.get(&id).map(|e| e.job.clone()))
    }

    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError> {
        let patch = patch.normalized();
        let mut inner = self.inner.write().await;
        let entry = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        // Validate on a copy so a rejected patch leaves no partial write.
        let mut job = entry.job.clone();
        job.apply(&patch)?;
        entry.job = job.clone();
        Ok(job)
    }

    async fn list_all(&self) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().await;
        let mut entries: Vec<&Entry> = inner.jobs.values().collect();
        entries.sort_by_key(|e| (e.job.updated_at, e.seq));
        Ok(entries.into_iter().map(|e| e.job.clone()).collect())
    }

    async fn close(&self) {}
}
