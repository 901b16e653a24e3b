use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use super::downloader::Downloader;
use super::error::{DownloadError, DownloadResult};
use super::progress::DownloadProgress;
use super::settings::DownloadSettings;
use super::DownloadJob;

/// Runs independent jobs concurrently.
///
/// Each job owns its own file handle, its own child process and a child of the
/// manager's cancellation token, so jobs share nothing but the destination
/// directory.
pub struct DownloadManager {
    downloader: Arc<Downloader>,
    semaphore: Arc<Semaphore>,
    active_downloads: Arc<RwLock<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
    progress_sender: mpsc::UnboundedSender<DownloadProgress>,
}

impl DownloadManager {
    pub fn new(
        settings: DownloadSettings,
        max_concurrent: usize,
    ) -> DownloadResult<(Self, mpsc::UnboundedReceiver<DownloadProgress>)> {
        let downloader = Arc::new(Downloader::new(settings)?);
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let (progress_sender, progress_receiver) = mpsc::unbounded_channel();

        Ok((
            Self {
                downloader,
                semaphore,
                active_downloads: Arc::new(RwLock::new(HashMap::new())),
                shutdown: CancellationToken::new(),
                progress_sender,
            },
            progress_receiver,
        ))
    }

    /// Downloads every job and returns the results in input order.
    pub async fn download_all(
        &self,
        jobs: Vec<DownloadJob>,
    ) -> Vec<(DownloadJob, DownloadResult<PathBuf>)> {
        let mut handles = Vec::with_capacity(jobs.len());
        let submitted = jobs.clone();

        for job in jobs {
            let token = self.shutdown.child_token();
            self.active_downloads
                .write()
                .await
                .insert(job.id.clone(), token.clone());

            let downloader = Arc::clone(&self.downloader);
            let semaphore = Arc::clone(&self.semaphore);
            let active_downloads = Arc::clone(&self.active_downloads);
            let progress_sender = self.progress_sender.clone();

            handles.push(tokio::spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(DownloadError::Cancelled),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(_permit) => {
                            downloader
                                .download_with_progress(&job, Some(progress_sender), &token)
                                .await
                        }
                        Err(_) => Err(DownloadError::Cancelled),
                    },
                };

                active_downloads.write().await.remove(&job.id);
                (job, result)
            }));
        }

        submitted
            .into_iter()
            .zip(join_all(handles).await)
            .map(|(submitted, joined)| {
                joined.unwrap_or_else(|e| (submitted, Err(DownloadError::Aborted(e.to_string()))))
            })
            .collect()
    }

    /// Cancels one job; unknown or finished ids are ignored.
    pub async fn cancel_download(&self, id: &str) {
        if let Some(token) = self.active_downloads.read().await.get(id) {
            token.cancel();
        }
    }

    /// Cancels every running and queued job.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token that cancels every job of this manager, for signal handlers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn get_active_downloads(&self) -> Vec<String> {
        self.active_downloads.read().await.keys().cloned().collect()
    }
}
