use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::AllowList;
use crate::config::ServerConfig;
use crate::coordinator::LocalCoordinator;
use crate::error::{LabqueueError, Result};
use crate::grpc::GrpcServer;
use crate::http::{self, HttpState};
use crate::logs::FileLogStore;
use crate::store::{JobStore, MemoryJobStore, PgJobStore};
use crate::worker::{DockerCli, WorkerPool};

/// The central process: job store, log store, HTTP API and worker RPC
/// service, plus optional in-process worker slots.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub async fn open_store(&self) -> Result<Arc<dyn JobStore>> {
        match &self.config.database_url {
            Some(url) => {
                let store = PgJobStore::connect(url, self.config.max_db_connections).await?;
                store.migrate().await?;
                Ok(Arc::new(store))
            }
            None => {
                tracing::warn!("No database configured, jobs are kept in memory only");
                Ok(Arc::new(MemoryJobStore::new()))
            }
        }
    }

    /// Run until `shutdown` fires.
    ///
    /// On shutdown the listeners stop accepting requests, live tails end, and
    /// embedded slots finish their current jobs before the store is closed.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if self.config.tokens.is_empty() {
            return Err(LabqueueError::Config(
                "at least one access token is required".to_string(),
            ));
        }

        let store = self.open_store().await?;
        let logs = FileLogStore::open(self.config.logs.clone()).await?;
        let tokens = AllowList::new(self.config.tokens.clone());

        let grpc = GrpcServer::new(
            self.config.grpc_addr,
            store.clone(),
            logs.clone(),
            tokens.clone(),
        );
        let grpc_shutdown = shutdown.clone();
        let mut grpc_handle = tokio::spawn(async move { grpc.run(grpc_shutdown).await });

        let pool_handle = if self.config.embedded_slots.is_empty() {
            None
        } else {
            let local = Arc::new(LocalCoordinator::new(store.clone(), logs.clone()));
            let pool = WorkerPool::for_slots(
                &self.config.embedded_slots,
                &self.config.container,
                &self.config.log_writer,
                self.config.poll_interval,
                Arc::new(DockerCli::new(self.config.container.clone())),
                local.clone(),
                local,
            );
            Some(tokio::spawn(pool.run(shutdown.clone())))
        };

        tracing::info!(
            http_addr = %self.config.http_addr,
            grpc_addr = %self.config.grpc_addr,
            embedded_slots = self.config.embedded_slots.len(),
            persistent = self.config.database_url.is_some(),
            "Starting labqueue server"
        );

        let state = HttpState {
            store: store.clone(),
            logs,
            tokens,
            shutdown: shutdown.clone(),
        };
        let app = http::router(state, self.config.request_timeout);
        let http_addr = self.config.http_addr;
        let http_shutdown = shutdown.clone();
        let http = async move {
            match TcpListener::bind(http_addr).await {
                Ok(listener) => http::run_http(listener, app, http_shutdown).await,
                Err(e) => {
                    tracing::error!(addr = %http_addr, error = %e, "Failed to bind HTTP server");
                    Err(e)
                }
            }
        };
        tokio::pin!(http);

        // Either listener stopping takes the whole server down.
        let (served, grpc_result) = tokio::select! {
            served = &mut http => {
                shutdown.cancel();
                (served, grpc_outcome(grpc_handle.await))
            }
            joined = &mut grpc_handle => {
                let grpc_result = grpc_outcome(joined);
                if !shutdown.is_cancelled() {
                    tracing::error!("gRPC server stopped, shutting down");
                    shutdown.cancel();
                }
                (http.await, grpc_result)
            }
        };

        if let Some(handle) = pool_handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Embedded worker pool failed");
            }
        }

        store.close().await;
        tracing::info!("Server stopped");
        served.map_err(LabqueueError::from).and(grpc_result)
    }
}

fn grpc_outcome(
    joined: std::result::Result<
        std::result::Result<(), tonic::transport::Error>,
        tokio::task::JoinError,
    >,
) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "gRPC server failed");
            Err(e.into())
        }
        Err(e) => {
            tracing::error!(error = %e, "gRPC server task failed");
            Err(e.into())
        }
    }
}
