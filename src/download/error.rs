use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by a single download job.
///
/// Nothing in the download core retries; every variant reaches the caller of
/// `Downloader::download` unchanged.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid download URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Network failure (`status` is `None`) or a non-2xx response.
    #[error("request to {url} failed{}", .status.map(|s| format!(" with HTTP {s}")).unwrap_or_default())]
    RemoteRequestFailed {
        url: String,
        status: Option<u16>,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("cannot derive a file name from {url}; pass an explicit name")]
    UnresolvableFileName { url: String },

    #[error("external downloader '{program}' was not found on PATH")]
    ExternalToolNotFound { program: String },

    #[error("external downloader failed{}", .exit_code.map(|c| format!(" with exit code {c}")).unwrap_or_else(|| " (terminated by signal)".to_string()))]
    ExternalToolFailed { exit_code: Option<i32> },

    #[error("lost contact with the external downloader: {reason}")]
    DelegationLost { reason: String },

    /// The partial file is left at `path`.
    #[error("transfer into {path:?} was interrupted: {source}")]
    TransferInterrupted {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("download cancelled")]
    Cancelled,

    #[error("download task aborted: {0}")]
    Aborted(String),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    pub fn remote(url: impl Into<String>, status: Option<u16>, source: Option<reqwest::Error>) -> Self {
        Self::RemoteRequestFailed {
            url: url.into(),
            status,
            source,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn interrupted(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::TransferInterrupted {
            path: path.into(),
            source,
        }
    }

    /// Whether a caller may reasonably retry the job with the built-in strategy.
    pub fn is_fallback_candidate(&self) -> bool {
        matches!(self, Self::ExternalToolNotFound { .. })
    }
}

pub type DownloadResult<T> = std::result::Result<T, DownloadError>;
