use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the sharing engine.
///
/// Everything network- or filesystem-related comes back as one of these so
/// the caller can decide whether to retry, rescan or tell the operator.
#[derive(Error, Debug)]
pub enum ShareError {
    #[error("no peers answered within the discovery timeout")]
    DiscoveryTimeout,

    #[error("discovery responder is already listening")]
    AlreadyListening,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("not connected to a peer")]
    NotConnected,

    #[error("directory unavailable: {path}: {reason}")]
    DirectoryUnavailable { path: PathBuf, reason: String },

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("entry is a folder: {0}")]
    IsFolder(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to bind {what}: {source}")]
    Bind {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ShareResult<T> = Result<T, ShareError>;

impl ShareError {
    /// True for the outcomes a stale catalog can produce; refetching fixes them.
    pub fn is_stale_catalog(&self) -> bool {
        matches!(self, ShareError::NotFound(_) | ShareError::IsFolder(_))
    }
}

impl From<quinn::ConnectionError> for ShareError {
    fn from(e: quinn::ConnectionError) -> Self {
        ShareError::Connection(e.to_string())
    }
}

impl From<quinn::ConnectError> for ShareError {
    fn from(e: quinn::ConnectError) -> Self {
        ShareError::Connection(e.to_string())
    }
}
