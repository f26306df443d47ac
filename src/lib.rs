//! Single-file resumable HTTP downloads: probe the remote file, stream it into a working
//! file, pause and resume without re-fetching received bytes, then strip the working
//! suffix once the transfer completes.

pub mod downloader;
pub mod error;
pub mod models;
pub mod naming;
pub mod probe;
pub mod session;
pub mod speed;
pub mod transport;

/// Re-exports of the common types.
pub mod prelude {
    pub use crate::error::DownloadError;
    pub use crate::models::{
        DownloadOptions, FinishReason, ProxyConfig, ProxyServer, RemoteFileInfo, SessionEvent,
        SessionState, Speed, SpeedUnit, TransferProgress,
    };
    pub use crate::probe::{probe_remote_file_info, MetadataProber};
    pub use crate::session::DownloadSession;
    pub use crate::transport::{HttpTransport, Transport};
}
