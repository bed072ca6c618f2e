use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Server;

use crate::auth::AllowList;
use crate::grpc::auth::TokenCheck;
use crate::grpc::worker_service::WorkerServiceImpl;
use crate::logs::FileLogStore;
use crate::proto::worker_service_server::WorkerServiceServer;
use crate::store::JobStore;

pub struct GrpcServer {
    addr: SocketAddr,
    store: Arc<dyn JobStore>,
    logs: FileLogStore,
    tokens: AllowList,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        store: Arc<dyn JobStore>,
        logs: FileLogStore,
        tokens: AllowList,
    ) -> Self {
        Self {
            addr,
            store,
            logs,
            tokens,
        }
    }

    fn service(&self) -> InterceptedService<WorkerServiceServer<WorkerServiceImpl>, TokenCheck> {
        let service = WorkerServiceImpl::new(self.store.clone(), self.logs.clone());
        WorkerServiceServer::with_interceptor(service, TokenCheck::new(self.tokens.clone()))
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(self.service())
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await
    }

    /// Serve on an already bound listener; the configured address is ignored.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Starting gRPC server");
        }

        Server::builder()
            .add_service(self.service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
            .await
    }
}
