use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use uuid::Uuid;

use crate::coordinator::{Coordinator, CoordinatorError};
use crate::grpc::convert::{job_from_proto, status_to_proto};
use crate::jobs::{Job, JobStatus};
use crate::logs::{LogConnector, LogError, LogTransport};
use crate::proto::log_frame::Payload;
use crate::proto::worker_service_client::WorkerServiceClient;
use crate::proto::{LogFrame, PollJobRequest, UpdateJobRequest, UploadLogsResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_BUFFER: usize = 16;

/// Adds the shared-secret token to every outgoing call.
#[derive(Clone)]
pub struct TokenInjector {
    token: MetadataValue<Ascii>,
}

impl Interceptor for TokenInjector {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert("authorization", self.token.clone());
        Ok(request)
    }
}

type Client = WorkerServiceClient<InterceptedService<Channel, TokenInjector>>;

/// Worker-side client of the server's `WorkerService`.
#[derive(Clone)]
pub struct GrpcCoordinator {
    client: Client,
    endpoint: Endpoint,
    token: MetadataValue<Ascii>,
    worker: String,
}

impl GrpcCoordinator {
    /// Build a client without dialing; the connection is made on first use,
    /// so a worker can start before its server.
    pub fn connect_lazy(
        url: &str,
        token: &str,
        worker: impl Into<String>,
    ) -> Result<Self, CoordinatorError> {
        let endpoint = Endpoint::from_shared(url.to_string())
            .map_err(|e| CoordinatorError::Unavailable(format!("invalid endpoint {url}: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT);
        let token = token
            .parse::<MetadataValue<Ascii>>()
            .map_err(|_| CoordinatorError::InvalidToken)?;

        let client = WorkerServiceClient::with_interceptor(
            endpoint.connect_lazy(),
            TokenInjector {
                token: token.clone(),
            },
        );

        Ok(Self {
            client,
            endpoint,
            token,
            worker: worker.into(),
        })
    }
}

#[async_trait]
impl Coordinator for GrpcCoordinator {
    async fn poll_job(&self) -> Result<Option<Job>, CoordinatorError> {
        let mut request = Request::new(PollJobRequest {
            worker: self.worker.clone(),
        });
        request.set_timeout(REQUEST_TIMEOUT);

        let response = self.client.clone().poll_job(request).await?.into_inner();
        Ok(response.job.map(job_from_proto).transpose()?)
    }

    async fn report_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> Result<Job, CoordinatorError> {
        let mut request = Request::new(UpdateJobRequest {
            job_id: job_id.to_string(),
            status: status_to_proto(status) as i32,
            ..Default::default()
        });
        request.set_timeout(REQUEST_TIMEOUT);

        let job = self.client.clone().update_job(request).await?.into_inner();
        Ok(job_from_proto(job)?)
    }
}

#[async_trait]
impl LogConnector for GrpcCoordinator {
    /// Each upload gets its own connection, dialed before returning, so an
    /// unreachable server fails here instead of on a later send.
    async fn connect(&self, job_id: Uuid) -> Result<Box<dyn LogTransport>, LogError> {
        let channel = self.endpoint.connect().await.map_err(|e| {
            LogError::Transport(format!("connect to {}: {e}", self.endpoint.uri()))
        })?;
        let mut client = WorkerServiceClient::with_interceptor(
            channel,
            TokenInjector {
                token: self.token.clone(),
            },
        );
        let (tx, rx) = mpsc::channel(UPLOAD_BUFFER);

        let call = tokio::spawn(async move {
            client
                .upload_logs(ReceiverStream::new(rx))
                .await
                .map(|response| response.into_inner())
        });

        Ok(Box::new(GrpcLogTransport {
            job_id: job_id.to_string(),
            tx: Some(tx),
            call: Some(call),
        }))
    }
}

/// One `UploadLogs` call. Chunks are sent as binary frames.
struct GrpcLogTransport {
    job_id: String,
    tx: Option<mpsc::Sender<LogFrame>>,
    call: Option<JoinHandle<Result<UploadLogsResponse, Status>>>,
}

impl GrpcLogTransport {
    async fn finish(&mut self) -> Result<UploadLogsResponse, LogError> {
        self.tx.take();
        let Some(call) = self.call.take() else {
            return Err(LogError::Closed);
        };
        match call.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(status)) => Err(LogError::Transport(format!(
                "{}: {}",
                status.code(),
                status.message()
            ))),
            Err(e) => Err(LogError::Transport(e.to_string())),
        }
    }

    /// Why the call ended before the upload was closed.
    async fn ended(&mut self) -> LogError {
        match self.finish().await {
            Ok(_) => LogError::Transport("upload stream ended early".to_string()),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl LogTransport for GrpcLogTransport {
    async fn send(&mut self, chunk: Bytes) -> Result<(), LogError> {
        if self.call.as_ref().is_some_and(JoinHandle::is_finished) {
            return Err(self.ended().await);
        }
        let Some(tx) = &self.tx else {
            return Err(LogError::Closed);
        };
        let frame = LogFrame {
            job_id: self.job_id.clone(),
            payload: Some(Payload::Binary(chunk.to_vec())),
        };
        if tx.send(frame).await.is_ok() {
            return Ok(());
        }
        Err(self.ended().await)
    }

    async fn close(&mut self) -> Result<(), LogError> {
        let response = self.finish().await?;
        tracing::debug!(job_id = %self.job_id, bytes = response.bytes_written, "Log upload finished");
        Ok(())
    }
}
