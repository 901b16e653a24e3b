pub mod aria2;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod filename;
pub mod manager;
pub mod progress;
pub mod settings;
pub mod strategy;

pub use aria2::Aria2Client;
pub use downloader::Downloader;
pub use engine::DownloadEngine;
pub use error::{DownloadError, DownloadResult};
pub use filename::resolve_file_name;
pub use manager::DownloadManager;
pub use progress::{DownloadProgress, ProgressTracker, TransferProgress};
pub use settings::{DelegationMode, DownloadSettings};
pub use strategy::{Strategy, probe_executable, select_strategy};

use std::path::PathBuf;
use std::sync::OnceLock;
use url::Url;

/// One transfer request: a source URL and the directory the file lands in.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: String,
    pub url: Url,
    pub destination_dir: PathBuf,
    pub referer: Option<String>,
    /// Set once, either by the caller or by the first response, then fixed.
    resolved_file_name: OnceLock<String>,
}

impl DownloadJob {
    /// Validates `url` (absolute, http or https).
    pub fn new(url: &str, destination_dir: impl Into<PathBuf>) -> DownloadResult<Self> {
        let invalid = |reason: String| DownloadError::InvalidUrl {
            url: url.to_string(),
            reason,
        };

        let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(format!("unsupported scheme '{other}'"))),
        }
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            url: parsed,
            destination_dir: destination_dir.into(),
            referer: None,
            resolved_file_name: OnceLock::new(),
        })
    }

    /// Overrides the resolved name; the override is sanitized the same way.
    pub fn with_file_name(mut self, name: impl Into<String>) -> DownloadResult<Self> {
        let name = name.into();
        let sanitized = filename::sanitize_file_name(&name).ok_or_else(|| {
            DownloadError::UnresolvableFileName {
                url: self.url.to_string(),
            }
        })?;
        self.resolved_file_name = OnceLock::from(sanitized);
        Ok(self)
    }

    /// Destination name, once known.
    pub fn file_name(&self) -> Option<&str> {
        self.resolved_file_name.get().map(String::as_str)
    }

    /// Fixes the destination name; a name that is already set wins.
    pub(crate) fn resolve_file_name_once(&self, name: String) -> &str {
        self.resolved_file_name.get_or_init(|| name)
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }
}
