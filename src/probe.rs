//! Best-effort discovery of the remote file's name, type and size.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::DownloadError;
use crate::models::{
    ProxyConfig, RemoteFileInfo, DEFAULT_PROBE_ATTEMPTS, DEFAULT_TIMEOUT, MIN_PROBE_TIMEOUT,
};
use crate::naming::{file_name_from_url, parse_content_disposition};
use crate::transport::{HeadResponse, HttpTransport, Transport};

/// Issues HEAD requests with a bounded number of attempts and a deadline per attempt.
///
/// Holds no state between calls; every [`probe`](Self::probe) starts from scratch.
#[derive(Clone)]
pub struct MetadataProber {
    transport: Arc<dyn Transport>,
    attempts: u32,
    attempt_timeout: Duration,
}

impl MetadataProber {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            attempts: DEFAULT_PROBE_ATTEMPTS,
            attempt_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Parses `url` and probes it. See [`probe_url`](Self::probe_url).
    pub async fn probe(&self, url: &str) -> Result<(RemoteFileInfo, bool), DownloadError> {
        let parsed =
            Url::parse(url).map_err(|e| DownloadError::invalid(format!("invalid URL {url:?}: {e}")))?;
        self.probe_url(&parsed).await
    }

    /// Returns the info of the first successful attempt with `true`, or the URL-derived
    /// fallback with `false` once every attempt failed or timed out.
    ///
    /// Only argument validation produces an `Err`; network trouble never does.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn probe_url(&self, url: &Url) -> Result<(RemoteFileInfo, bool), DownloadError> {
        if self.attempts < 1 {
            return Err(DownloadError::invalid("probe needs at least one attempt"));
        }
        if self.attempt_timeout < MIN_PROBE_TIMEOUT {
            return Err(DownloadError::invalid(format!(
                "probe timeout {:?} is below the minimum of {MIN_PROBE_TIMEOUT:?}",
                self.attempt_timeout
            )));
        }

        for attempt in 1..=self.attempts {
            let head = tokio::time::timeout(
                self.attempt_timeout,
                self.transport.head(url, self.attempt_timeout),
            )
            .await;
            match head {
                Ok(Ok(head)) => {
                    debug!(attempt, status = head.status, "probe succeeded");
                    return Ok((file_info_from_head(url, &head), true));
                }
                Ok(Err(e)) => warn!(attempt, error = %e, "failed to query file information"),
                Err(_) => warn!(
                    attempt,
                    timeout = ?self.attempt_timeout,
                    "file information query timed out"
                ),
            }
        }

        Ok((
            RemoteFileInfo {
                file_name: file_name_from_url(url),
                ..RemoteFileInfo::default()
            },
            false,
        ))
    }
}

fn file_info_from_head(url: &Url, head: &HeadResponse) -> RemoteFileInfo {
    let file_size = match head.content_length {
        Some(size) if size > 0 => size,
        _ => {
            warn!(%url, "server did not report the file size");
            0
        }
    };
    let file_name = match head
        .content_disposition
        .as_deref()
        .and_then(parse_content_disposition)
    {
        Some(name) => name,
        None => {
            debug!(%url, "no file name from server, using the one from the URL");
            file_name_from_url(url)
        }
    };
    RemoteFileInfo {
        file_name,
        file_type: head.content_type.clone().unwrap_or_default(),
        file_size,
    }
}

/// Probes `url` with a fresh system-proxy [`HttpTransport`], independent of any session.
pub async fn probe_remote_file_info(
    url: &str,
    max_attempts: u32,
    per_attempt_timeout: Duration,
) -> Result<(RemoteFileInfo, bool), DownloadError> {
    let transport = Arc::new(HttpTransport::new(&ProxyConfig::System)?);
    MetadataProber::new(transport)
        .with_attempts(max_attempts)
        .with_attempt_timeout(per_attempt_timeout)
        .probe(url)
        .await
}
