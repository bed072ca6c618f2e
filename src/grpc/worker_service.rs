use std::sync::Arc;

use tonic::{Request, Response, Status, Streaming};
use uuid::Uuid;

use crate::grpc::convert::{job_to_proto, parse_job_id, parse_metadata, status_from_proto};
use crate::jobs::JobPatch;
use crate::logs::{FileLogStore, LogAppender, LogStoreError};
use crate::proto::log_frame::Payload;
use crate::proto::worker_service_server::WorkerService;
use crate::proto::{
    Job as ProtoJob, LogFrame, PollJobRequest, PollJobResponse, UpdateJobRequest,
    UploadLogsResponse,
};
use crate::store::{JobStore, StoreError};

/// gRPC service used by remote workers: claims, status reports and log upload.
pub struct WorkerServiceImpl {
    store: Arc<dyn JobStore>,
    logs: FileLogStore,
}

impl WorkerServiceImpl {
    pub fn new(store: Arc<dyn JobStore>, logs: FileLogStore) -> Self {
        Self { store, logs }
    }

    async fn ensure_job(&self, job_id: Uuid) -> Result<(), Status> {
        match self.store.get_by_id(job_id).await.map_err(store_status)? {
            Some(_) => Ok(()),
            None => Err(Status::not_found("Job not found")),
        }
    }
}

pub(crate) fn store_status(err: StoreError) -> Status {
    match err {
        StoreError::Storage(msg) => Status::unavailable(msg),
        StoreError::NotFound(_) => Status::not_found("Job not found"),
        StoreError::InvalidTransition(e) => Status::failed_precondition(e.to_string()),
    }
}

fn log_status(err: LogStoreError) -> Status {
    Status::internal(err.to_string())
}

#[tonic::async_trait]
impl WorkerService for WorkerServiceImpl {
    async fn poll_job(
        &self,
        request: Request<PollJobRequest>,
    ) -> Result<Response<PollJobResponse>, Status> {
        let worker = request.into_inner().worker;
        let job = self.store.fetch_job().await.map_err(store_status)?;

        if let Some(ref job) = job {
            tracing::info!(job_id = %job.id, worker = %worker, "Job claimed");
        }

        Ok(Response::new(PollJobResponse {
            job: job.as_ref().map(job_to_proto),
        }))
    }

    async fn update_job(
        &self,
        request: Request<UpdateJobRequest>,
    ) -> Result<Response<ProtoJob>, Status> {
        let req = request.into_inner();
        let job_id = parse_job_id(&req.job_id)?;

        let patch = JobPatch {
            name: Some(req.name),
            description: Some(req.description),
            status: status_from_proto(req.status)?,
            metadata: req
                .metadata_json
                .as_deref()
                .map(parse_metadata)
                .transpose()?,
        }
        .normalized();

        let job = self
            .store
            .update(job_id, patch)
            .await
            .map_err(store_status)?;

        tracing::info!(job_id = %job.id, status = %job.status, "Job updated");
        Ok(Response::new(job_to_proto(&job)))
    }

    async fn upload_logs(
        &self,
        request: Request<Streaming<LogFrame>>,
    ) -> Result<Response<UploadLogsResponse>, Status> {
        let mut frames = request.into_inner();
        let mut appender: Option<LogAppender> = None;

        while let Some(frame) = frames.message().await? {
            let data = match frame.payload {
                Some(Payload::Binary(data)) => data,
                Some(Payload::Text(_)) | None => {
                    tracing::debug!(job_id = %frame.job_id, "Ignoring non-binary log frame");
                    continue;
                }
            };

            let job_id = parse_job_id(&frame.job_id)?;
            if appender.as_ref().is_some_and(|a| a.job_id() != job_id) {
                return Err(Status::invalid_argument(
                    "Log frames for more than one job in one upload",
                ));
            }
            if appender.is_none() {
                self.ensure_job(job_id).await?;
                appender = Some(self.logs.appender(job_id).await.map_err(log_status)?);
            }
            if let Some(appender) = appender.as_mut() {
                appender.append(&data).await.map_err(log_status)?;
            }
        }

        let bytes_written = appender.as_ref().map_or(0, LogAppender::bytes_written);
        if let Some(appender) = appender {
            tracing::debug!(job_id = %appender.job_id(), bytes = bytes_written, "Log upload finished");
        }

        Ok(Response::new(UploadLogsResponse { bytes_written }))
    }
}
