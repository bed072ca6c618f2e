use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::logs::store::Notifier;
use crate::logs::{find, LogStoreError, END_OF_STREAM};

/// Live feed of a job's log, one message per line without the trailing newline.
pub type LogFollow = ReceiverStream<Result<String, LogStoreError>>;

const FOLLOW_BUFFER: usize = 64;

pub(crate) fn spawn_follow(
    path: PathBuf,
    notify: Notifier,
    poll: Duration,
    cancel: CancellationToken,
) -> LogFollow {
    let (tx, rx) = mpsc::channel(FOLLOW_BUFFER);

    tokio::spawn(async move {
        if let Err(e) = follow_file(&path, &notify, poll, &cancel, &tx).await {
            tracing::warn!(path = %path.display(), error = %e, "Log follow failed");
            let _ = tx.send(Err(e)).await;
        }
    });

    ReceiverStream::new(rx)
}

enum Wake {
    Changed,
    Stop,
}

/// Park until the log may have changed, or until the follow should end.
async fn wait_for_change(
    notified: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>,
    poll: Duration,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Result<String, LogStoreError>>,
) -> Wake {
    tokio::select! {
        _ = cancel.cancelled() => Wake::Stop,
        _ = tx.closed() => Wake::Stop,
        _ = notified => Wake::Changed,
        _ = tokio::time::sleep(poll) => Wake::Changed,
    }
}

async fn follow_file(
    path: &Path,
    notify: &Notify,
    poll: Duration,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Result<String, LogStoreError>>,
) -> Result<(), LogStoreError> {
    let file = loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match File::open(path).await {
            Ok(file) => break file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Wake::Stop = wait_for_change(notified, poll, cancel, tx).await {
                    return Ok(());
                }
            }
            Err(e) => return Err(e.into()),
        }
    };

    let mut reader = BufReader::new(file);
    let mut line = Vec::new();

    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        reader.read_until(b'\n', &mut line).await?;

        if line.last() != Some(&b'\n') {
            // Partial line or nothing new: keep what we have and wait.
            if let Wake::Stop = wait_for_change(notified, poll, cancel, tx).await {
                return Ok(());
            }
            continue;
        }

        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        if let Some(pos) = find(&line, END_OF_STREAM.as_bytes()) {
            if pos > 0 {
                let text = String::from_utf8_lossy(&line[..pos]).into_owned();
                let _ = tx.send(Ok(text)).await;
            }
            return Ok(());
        }

        let text = String::from_utf8_lossy(&line).into_owned();
        if tx.send(Ok(text)).await.is_err() {
            return Ok(());
        }
        line.clear();
    }
}
