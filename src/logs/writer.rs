use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LogWriterConfig;
use crate::logs::END_OF_STREAM;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("log transport lost: {0}")]
    TransportLost(String),

    #[error("log transport error: {0}")]
    Transport(String),

    #[error("log stream is closed")]
    Closed,
}

/// One open upload channel to the central log store.
#[async_trait]
pub trait LogTransport: Send {
    async fn send(&mut self, chunk: Bytes) -> Result<(), LogError>;

    /// Finish the upload. The transport is not used afterwards.
    async fn close(&mut self) -> Result<(), LogError>;
}

/// Opens upload channels for a job's log.
#[async_trait]
pub trait LogConnector: Send + Sync {
    async fn connect(&self, job_id: Uuid) -> Result<Box<dyn LogTransport>, LogError>;
}

enum Connection {
    Connected(Box<dyn LogTransport>),
    Disconnected,
    Failed,
}

struct Pending {
    buf: BytesMut,
    at_line_start: bool,
}

struct Shared {
    job_id: Uuid,
    connector: Arc<dyn LogConnector>,
    config: LogWriterConfig,
    pending: StdMutex<Pending>,
    connection: Mutex<Connection>,
    closed: AtomicBool,
    failed: AtomicBool,
    stop: CancellationToken,
    ticker: StdMutex<Option<JoinHandle<()>>>,
}

/// Buffered producer for one job's log.
///
/// Writes only touch the in-memory buffer. A background task pushes the
/// buffer every `flush_interval`, and a write that overflows
/// `max_buffered_bytes` flushes inline. When a send fails the writer makes a
/// single reconnect attempt, bounded by one flush interval, and resends the
/// chunk once. If that fails too the transport is marked lost: buffered bytes
/// are dropped and every later write returns [`LogError::TransportLost`].
#[derive(Clone)]
pub struct LogWriter {
    shared: Arc<Shared>,
}

impl LogWriter {
    pub async fn open(
        job_id: Uuid,
        connector: Arc<dyn LogConnector>,
        config: LogWriterConfig,
    ) -> Result<Self, LogError> {
        let transport = connector.connect(job_id).await?;
        let period = config.flush_interval;

        let shared = Arc::new(Shared {
            job_id,
            connector,
            config,
            pending: StdMutex::new(Pending {
                buf: BytesMut::new(),
                at_line_start: true,
            }),
            connection: Mutex::new(Connection::Connected(transport)),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            stop: CancellationToken::new(),
            ticker: StdMutex::new(None),
        });

        let handle = tokio::spawn(flush_ticker(
            Arc::downgrade(&shared),
            period,
            shared.stop.clone(),
        ));
        *lock(&shared.ticker) = Some(handle);

        Ok(Self { shared })
    }

    pub fn job_id(&self) -> Uuid {
        self.shared.job_id
    }

    pub fn is_lost(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), LogError> {
        self.buffer(false, data).await
    }

    /// Write `line` on a line of its own.
    pub async fn write_line(&self, line: &str) -> Result<(), LogError> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.buffer(true, &data).await
    }

    pub async fn flush(&self) -> Result<(), LogError> {
        self.shared.flush().await
    }

    /// Append the end-of-stream marker, push everything out and close the
    /// transport. Calling `close` again is a no-op.
    pub async fn close(&self) -> Result<(), LogError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shared.stop.cancel();
        let ticker = lock(&self.shared.ticker).take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                tracing::warn!(job_id = %self.shared.job_id, error = %e, "Log flush task failed");
            }
        }

        {
            let mut pending = lock(&self.shared.pending);
            if !pending.at_line_start {
                pending.buf.put_u8(b'\n');
            }
            pending.buf.extend_from_slice(END_OF_STREAM.as_bytes());
            pending.buf.put_u8(b'\n');
            pending.at_line_start = true;
        }

        let flushed = self.shared.flush().await;

        let mut connection = self.shared.connection.lock().await;
        let closed = match std::mem::replace(&mut *connection, Connection::Failed) {
            Connection::Connected(mut transport) => transport.close().await,
            Connection::Disconnected | Connection::Failed => Ok(()),
        };

        flushed.and(closed)
    }

    async fn buffer(&self, own_line: bool, data: &[u8]) -> Result<(), LogError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        if self.is_lost() {
            return Err(LogError::TransportLost(
                "earlier reconnect attempt failed".to_string(),
            ));
        }
        if data.is_empty() {
            return Ok(());
        }

        let overflow = {
            let mut pending = lock(&self.shared.pending);
            if own_line && !pending.at_line_start {
                pending.buf.put_u8(b'\n');
            }
            pending.buf.extend_from_slice(data);
            pending.at_line_start = data.ends_with(b"\n");
            pending.buf.len() >= self.shared.config.max_buffered_bytes
        };

        if overflow {
            self.shared.flush().await?;
        }
        Ok(())
    }
}

impl Shared {
    async fn flush(&self) -> Result<(), LogError> {
        // Holding the connection lock while taking the buffer keeps chunks in
        // write order across the ticker and inline flushes.
        let mut connection = self.connection.lock().await;
        let chunk = {
            let mut pending = lock(&self.pending);
            if pending.buf.is_empty() {
                return Ok(());
            }
            pending.buf.split().freeze()
        };
        self.send(&mut connection, chunk).await
    }

    async fn send(&self, connection: &mut Connection, chunk: Bytes) -> Result<(), LogError> {
        match connection {
            Connection::Connected(transport) => match transport.send(chunk.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Log transport failed, reconnecting");
                }
            },
            Connection::Failed => {
                return Err(LogError::TransportLost(
                    "earlier reconnect attempt failed".to_string(),
                ))
            }
            Connection::Disconnected => {}
        }

        *connection = Connection::Disconnected;
        let resent = match self.reconnect().await {
            Ok(mut transport) => match transport.send(chunk).await {
                Ok(()) => Ok(transport),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match resent {
            Ok(transport) => {
                tracing::info!(job_id = %self.job_id, "Log transport reconnected");
                *connection = Connection::Connected(transport);
                Ok(())
            }
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Log transport lost, dropping further output");
                *connection = Connection::Failed;
                self.failed.store(true, Ordering::Release);
                lock(&self.pending).buf.clear();
                Err(LogError::TransportLost(e.to_string()))
            }
        }
    }

    async fn reconnect(&self) -> Result<Box<dyn LogTransport>, LogError> {
        let limit = self.config.flush_interval;
        match tokio::time::timeout(limit, self.connector.connect(self.job_id)).await {
            Ok(result) => result,
            Err(_) => Err(LogError::Transport(format!(
                "reconnect timed out after {}ms",
                limit.as_millis()
            ))),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn flush_ticker(shared: Weak<Shared>, period: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };
        if let Err(e) = shared.flush().await {
            tracing::debug!(job_id = %shared.job_id, error = %e, "Periodic log flush failed");
            if shared.failed.load(Ordering::Acquire) {
                break;
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
