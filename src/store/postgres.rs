use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::jobs::{DockerSpec, Environment, Job, JobPatch, JobSpec, JobStatus};
use crate::store::{JobStore, StoreError};

const JOB_COLUMNS: &str = "id, name, description, docker_image, docker_command, \
     docker_environment, metadata, status::text AS status, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    description: String,
    docker_image: String,
    docker_command: String,
    docker_environment: Json<Environment>,
    metadata: Json<Value>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(StoreError::Storage)?;

        Ok(Job {
            id: row.id,
            name: row.name,
            description: row.description,
            docker: DockerSpec {
                image: row.docker_image,
                command: row.docker_command,
                environment: row.docker_environment.0,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
            status,
            metadata: row.metadata.0,
        })
    }
}

/// PostgreSQL-backed job table.
///
/// The claim is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP
/// LOCKED)`, so concurrent pollers in different processes each lock a
/// different row or get nothing.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a few retries, doubling the delay each time.
    #[instrument(skip(url))]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let mut retries = 5;
        let mut delay = Duration::from_millis(500);

        loop {
            match PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(url)
                .await
            {
                Ok(pool) => {
                    tracing::info!("PostgreSQL connection pool established");
                    return Ok(Self::new(pool));
                }
                Err(e) if retries > 0 => {
                    retries -= 1;
                    tracing::warn!(
                        error = %e,
                        retries_left = retries,
                        delay_ms = delay.as_millis() as u64,
                        "PostgreSQL connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(StoreError::storage(e)),
            }
        }
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(StoreError::storage)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, spec), fields(image = %spec.docker.image))]
    async fn insert(&self, spec: JobSpec) -> Result<Job, StoreError> {
        let query = format!(
            "INSERT INTO jobs (id, name, description, docker_image, docker_command, \
             docker_environment, metadata) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {JOB_COLUMNS}"
        );

        let row: JobRow = sqlx::query_as(&query)
            .bind(Uuid::new_v4())
            .bind(&spec.name)
            .bind(&spec.description)
            .bind(&spec.docker.image)
            .bind(&spec.docker.command)
            .bind(Json(&spec.docker.environment))
            .bind(Json(&spec.metadata))
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::storage)?;

        row.try_into()
    }

    #[instrument(skip(self))]
    async fn fetch_job(&self) -> Result<Option<Job>, StoreError> {
        let query = format!(
            "UPDATE jobs SET status = 'RUNNING'::job_status, updated_at = current_timestamp \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE status = 'ENQUEUED'::job_status \
                 ORDER BY created_at, seq \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1) \
             RETURNING {JOB_COLUMNS}"
        );

        let row: Option<JobRow> = sqlx::query_as(&query)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::storage)?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");

        let row: Option<JobRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::storage)?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self, patch), fields(job_id = %id))]
    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError> {
        let patch = patch.normalized();
        let mut tx = self.pool.begin().await.map_err(StoreError::storage)?;

        // Row lock keeps the transition check and the write in one step.
        let select = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
        let current: Option<JobRow> = sqlx::query_as(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::storage)?;

        let mut job: Job = current.ok_or(StoreError::NotFound(id))?.try_into()?;
        job.apply(&patch)?;

        let update = format!(
            "UPDATE jobs SET name = $2, description = $3, status = $4::job_status, \
             metadata = $5, updated_at = current_timestamp \
             WHERE id = $1 RETURNING {JOB_COLUMNS}"
        );
        let row: JobRow = sqlx::query_as(&update)
            .bind(id)
            .bind(&job.name)
            .bind(&job.description)
            .bind(job.status.as_str())
            .bind(Json(&job.metadata))
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::storage)?;

        tx.commit().await.map_err(StoreError::storage)?;
        row.try_into()
    }

    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<Job>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY updated_at, seq");

        let rows: Vec<JobRow> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::storage)?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
