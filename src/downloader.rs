use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::DownloadError;
use crate::transport::{GetResponse, Transport};

/// Parameters of one physical transfer attempt.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: Url,
    /// Working file. Appended to when `resume_from > 0`, truncated otherwise.
    pub path: PathBuf,
    pub resume_from: u64,
    /// Maximum silence between two chunks (or before the first one).
    pub stall_timeout: Duration,
}

/// Notifications of a running attempt, in order. `Finished` is always the last one and is
/// never sent for an aborted attempt.
#[derive(Debug)]
pub enum TransferEvent {
    /// Counters of this response only: bytes written so far and the announced body length.
    Progress { received: u64, total: Option<u64> },
    /// The server answered a ranged request with the whole body. The working file was
    /// truncated and the body is written from byte 0.
    RangeIgnored,
    Finished(TransferOutcome),
}

#[derive(Debug)]
pub enum TransferOutcome {
    Completed,
    Redirect(Url),
    Failed(DownloadError),
}

/// What an attempt left in the working file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Bytes written by this attempt.
    pub written: u64,
    /// The file was truncated because the server ignored the range.
    pub restarted: bool,
}

/// Runs a single streaming GET into a file.
pub struct TransferEngine;

impl TransferEngine {
    /// Opens the working file, then spawns the request. The file is opened before returning
    /// so that an unwritable destination is reported to the caller directly.
    pub async fn begin(
        transport: Arc<dyn Transport>,
        request: TransferRequest,
        events: UnboundedSender<TransferEvent>,
    ) -> Result<TransferHandle, DownloadError> {
        let append = request.resume_from > 0;
        let file = open_working_file(&request.path, append).await?;
        debug!(
            url = %request.url,
            path = %request.path.display(),
            resume_from = request.resume_from,
            "transfer starting"
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(transport, request, file, events, cancel.clone()));
        Ok(TransferHandle { cancel, task })
    }
}

/// Owner of a running attempt.
#[derive(Debug)]
pub struct TransferHandle {
    cancel: CancellationToken,
    task: JoinHandle<TransferSummary>,
}

impl TransferHandle {
    /// Cancels the request and waits until the file handle is closed. No outcome is
    /// reported for an aborted attempt.
    pub async fn abort(self) -> TransferSummary {
        self.cancel.cancel();
        self.join().await
    }

    /// Waits for the attempt to end on its own.
    pub async fn join(self) -> TransferSummary {
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "transfer task ended abnormally");
                TransferSummary::default()
            }
        }
    }
}

async fn open_working_file(path: &Path, append: bool) -> Result<File, DownloadError> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))
}

async fn run(
    transport: Arc<dyn Transport>,
    request: TransferRequest,
    mut file: File,
    events: UnboundedSender<TransferEvent>,
    cancel: CancellationToken,
) -> TransferSummary {
    let mut summary = TransferSummary::default();
    let outcome =
        stream_to_file(&*transport, &request, &mut file, &events, &cancel, &mut summary).await;
    // The handle is closed before the outcome goes out, or before `abort` returns.
    drop(file);
    if let Some(outcome) = outcome {
        let _ = events.send(TransferEvent::Finished(outcome));
    }
    summary
}

/// `None` when cancelled. Cancellation is only observed while waiting on the network,
/// a chunk that has been received is always written and flushed completely.
async fn stream_to_file(
    transport: &dyn Transport,
    request: &TransferRequest,
    file: &mut File,
    events: &UnboundedSender<TransferEvent>,
    cancel: &CancellationToken,
    summary: &mut TransferSummary,
) -> Option<TransferOutcome> {
    let stall = request.stall_timeout;
    let range_start = (request.resume_from > 0).then_some(request.resume_from);

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        response = tokio::time::timeout(stall, transport.get(&request.url, range_start)) => response,
    };
    let (total, partial, mut stream) = match response {
        Err(_) => return Some(TransferOutcome::Failed(DownloadError::Timeout(stall))),
        Ok(Err(e)) => return Some(TransferOutcome::Failed(e)),
        Ok(Ok(GetResponse::Redirect(target))) => return Some(TransferOutcome::Redirect(target)),
        Ok(Ok(GetResponse::Body {
            content_length,
            partial,
            stream,
        })) => (content_length, partial, stream),
    };

    if range_start.is_some() && !partial {
        warn!(url = %request.url, "server ignored the range request, restarting from byte 0");
        if let Err(e) = file.set_len(0).await {
            return Some(TransferOutcome::Failed(DownloadError::io(&request.path, e)));
        }
        summary.restarted = true;
        let _ = events.send(TransferEvent::RangeIgnored);
    }
    let _ = events.send(TransferEvent::Progress { received: 0, total });

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            next = tokio::time::timeout(stall, stream.next()) => next,
        };
        let chunk = match next {
            Err(_) => return Some(TransferOutcome::Failed(DownloadError::Timeout(stall))),
            Ok(None) => return Some(TransferOutcome::Completed),
            Ok(Some(Err(e))) => return Some(TransferOutcome::Failed(e)),
            Ok(Some(Ok(chunk))) => chunk,
        };

        let write = async {
            file.write_all(&chunk).await?;
            file.flush().await
        };
        if let Err(e) = write.await {
            return Some(TransferOutcome::Failed(DownloadError::io(&request.path, e)));
        }
        summary.written += chunk.len() as u64;
        let _ = events.send(TransferEvent::Progress {
            received: summary.written,
            total,
        });
    }
}
