use std::collections::HashMap;
use std::io::ErrorKind;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LogStoreConfig;
use crate::logs::strip_end_marker;
use crate::logs::tail::{self, LogFollow};

#[derive(Error, Debug)]
pub enum LogStoreError {
    #[error("log i/o error: {0}")]
    Io(#[from] std::io::Error),
}

type Registry = StdMutex<HashMap<Uuid, Arc<Notify>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<Uuid, Arc<Notify>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    config: LogStoreConfig,
    notifiers: Arc<Registry>,
}

/// One append-only file per job under a directory.
///
/// Appenders wake the job's followers on every write; followers also re-check
/// on a short interval so a missed wake-up only adds latency.
#[derive(Clone)]
pub struct FileLogStore {
    inner: Arc<Inner>,
}

impl FileLogStore {
    pub async fn open(config: LogStoreConfig) -> Result<Self, LogStoreError> {
        tokio::fs::create_dir_all(&config.dir).await?;
        tracing::info!(dir = %config.dir.display(), "Log store ready");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                notifiers: Arc::new(StdMutex::new(HashMap::new())),
            }),
        })
    }

    pub fn config(&self) -> &LogStoreConfig {
        &self.inner.config
    }

    pub fn path(&self, job_id: Uuid) -> PathBuf {
        self.inner.config.dir.join(format!("{job_id}.log"))
    }

    /// Open the job's log for appending, creating it on first use.
    pub async fn appender(&self, job_id: Uuid) -> Result<LogAppender, LogStoreError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(job_id))
            .await?;

        Ok(LogAppender {
            job_id,
            file,
            notifier: self.notifier(job_id),
            written: 0,
        })
    }

    /// Everything written so far, without the end-of-stream marker.
    ///
    /// A log that does not exist yet is awaited for `missing_log_grace`; if it
    /// still does not exist the result is empty.
    pub async fn read_all(&self, job_id: Uuid) -> Result<Bytes, LogStoreError> {
        let path = self.path(job_id);
        let config = &self.inner.config;
        let deadline = tokio::time::Instant::now() + config.missing_log_grace;

        loop {
            match tokio::fs::read(&path).await {
                Ok(data) => {
                    let visible = strip_end_marker(&data).len();
                    let mut data = data;
                    data.truncate(visible);
                    return Ok(Bytes::from(data));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(Bytes::new());
                    }
                    tokio::time::sleep(config.follow_poll_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Follow the job's log line by line.
    ///
    /// The stream waits for the log to be created, ends after the
    /// end-of-stream marker, and also ends when `cancel` fires or the stream
    /// is dropped.
    pub fn follow(&self, job_id: Uuid, cancel: CancellationToken) -> LogFollow {
        tail::spawn_follow(
            self.path(job_id),
            self.notifier(job_id),
            self.inner.config.follow_poll_interval,
            cancel,
        )
    }

    fn notifier(&self, job_id: Uuid) -> Notifier {
        let notify = lock(&self.inner.notifiers)
            .entry(job_id)
            .or_default()
            .clone();
        Notifier {
            job_id,
            notify,
            registry: self.inner.notifiers.clone(),
        }
    }
}

/// Shared wake-up handle for one job's appenders and followers.
///
/// The store drops its entry for the job when the last handle goes away.
pub(crate) struct Notifier {
    job_id: Uuid,
    notify: Arc<Notify>,
    registry: Arc<Registry>,
}

impl Deref for Notifier {
    type Target = Notify;

    fn deref(&self) -> &Notify {
        &self.notify
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        let mut notifiers = lock(&self.registry);
        // Our reference must go while the lock is held, or two handles
        // dropping together can each see the other and leave the entry behind.
        drop(std::mem::take(&mut self.notify));
        if notifiers
            .get(&self.job_id)
            .is_some_and(|notify| Arc::strong_count(notify) == 1)
        {
            notifiers.remove(&self.job_id);
        }
    }
}

/// Write handle for one job's log file.
pub struct LogAppender {
    job_id: Uuid,
    file: File,
    notifier: Notifier,
    written: u64,
}

impl LogAppender {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn append(&mut self, data: &[u8]) -> Result<(), LogStoreError> {
        if data.is_empty() {
            return Ok(());
        }
        self.file.write_all(data).await?;
        self.file.flush().await?;
        self.written += data.len() as u64;
        self.notifier.notify_waiters();
        Ok(())
    }
}
