// src/error.rs

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::models::SessionState;

/// Errors produced by the prober, the transfer engine and the session.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Rejected synchronously; the operation had no effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A command was issued from a state that does not accept it.
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Transport failure that did not come from reqwest.
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("no data received within {0:?}")]
    Timeout(Duration),
}

impl DownloadError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Timeouts are reported separately from other network failures only for diagnostics.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Network(e) => e.is_timeout(),
            _ => false,
        }
    }
}
