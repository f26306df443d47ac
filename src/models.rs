// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DOWNLOADING_SUFFIX: &str = "downloading";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 5;
/// Probes refuse per-attempt deadlines shorter than this.
pub const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

/// What the server told us about the file before the transfer started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileInfo {
    pub file_name: String,
    /// MIME type as reported by the server, empty when unknown.
    pub file_type: String,
    /// Size in bytes, 0 when unknown.
    pub file_size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedUnit {
    #[default]
    #[serde(rename = "B/s")]
    BytesPerSec,
    #[serde(rename = "KB/s")]
    KiloBytesPerSec,
    #[serde(rename = "MB/s")]
    MegaBytesPerSec,
}

impl SpeedUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedUnit::BytesPerSec => "B/s",
            SpeedUnit::KiloBytesPerSec => "KB/s",
            SpeedUnit::MegaBytesPerSec => "MB/s",
        }
    }
}

impl fmt::Display for SpeedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A throughput reading scaled to a human-friendly unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Speed {
    pub value: f64,
    pub unit: SpeedUnit,
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.value, self.unit)
    }
}

/// Snapshot published on every progress callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Completion in `0.0..=1.0`.
    pub fraction: f64,
    pub speed: Speed,
}

impl TransferProgress {
    /// Overall completion across pauses.
    ///
    /// After a resume `total_this_run` is the remaining length of the ranged response, so
    /// the result only approximates the true completion. The value is clamped to `0.0..=1.0`.
    pub fn fraction(received_this_run: u64, total_this_run: u64, received_prior_runs: u64) -> f64 {
        let denominator = total_this_run.saturating_add(received_prior_runs);
        if denominator == 0 {
            return 0.0;
        }
        let numerator = received_this_run.saturating_add(received_prior_runs);
        (numerator as f64 / denominator as f64).clamp(0.0, 1.0)
    }
}

/// Public state machine of a [`DownloadSession`](crate::session::DownloadSession).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    Probing,
    Downloading,
    Paused,
    Finalizing,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyServer {
    pub host: String,
    pub port: u16,
    /// Empty when the proxy needs no authentication.
    pub user: String,
    pub password: String,
}

/// Proxy used by the HTTP transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyConfig {
    /// Whatever the environment configures (`HTTP_PROXY`, `ALL_PROXY`, ...).
    #[default]
    System,
    Socks5(ProxyServer),
    Http(ProxyServer),
}

/// Why a session emitted its terminal notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// `path` is the final file, or the working file if stripping the suffix failed.
    Completed { path: PathBuf },
    Failed { reason: String },
    Stopped,
}

/// Change notifications published by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    UrlChanged(String),
    SaveDirectoryChanged(PathBuf),
    TimeoutChanged(Duration),
    DownloadingSuffixChanged(String),
    ProxyChanged(ProxyConfig),
    ProgressChanged(f64),
    SpeedChanged(Speed),
    FileInfoChanged(RemoteFileInfo),
    BreakpointSupportedChanged(bool),
    StateChanged(SessionState),
    Finished(FinishReason),
}

/// Configuration a session starts with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    pub save_directory: PathBuf,
    /// Appended to the local file name while the transfer is incomplete, without the dot.
    pub downloading_suffix: String,
    /// Stall timeout of a transfer. Zero means [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,
    pub probe_attempts: u32,
    pub probe_timeout: Duration,
    pub proxy: ProxyConfig,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            save_directory: default_save_directory(),
            downloading_suffix: DEFAULT_DOWNLOADING_SUFFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
            probe_attempts: DEFAULT_PROBE_ATTEMPTS,
            probe_timeout: DEFAULT_TIMEOUT,
            proxy: ProxyConfig::System,
        }
    }
}

impl DownloadOptions {
    pub fn effective_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        }
    }
}

/// The directory holding the running executable, or `.` if that cannot be determined.
pub fn default_save_directory() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}
