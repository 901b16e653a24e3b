use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::aria2::Aria2Client;
use super::engine::DownloadEngine;
use super::error::{DownloadError, DownloadResult};
use super::filename::resolve_file_name;
use super::progress::{DownloadProgress, ProgressReporter};
use super::settings::DownloadSettings;
use super::strategy::{Strategy, probe_executable, select_strategy};
use super::DownloadJob;

/// Entry point for a single download.
///
/// Every job issues one GET, resolves the destination name, and returns early when
/// the destination already exists. Otherwise the body is streamed in-process or the
/// job is handed to aria2, depending on the settings and on whether aria2 can be
/// found at that moment.
pub struct Downloader {
    engine: DownloadEngine,
    settings: DownloadSettings,
}

impl Downloader {
    pub fn new(settings: DownloadSettings) -> DownloadResult<Self> {
        let engine = DownloadEngine::new(&settings)?;
        Ok(Self { engine, settings })
    }

    /// Strategy the next job would use.
    pub fn strategy(&self) -> Strategy {
        let probed = if self.settings.enabled {
            probe_executable(&self.settings.program)
        } else {
            None
        };
        select_strategy(&self.settings, probed.as_deref())
    }

    pub async fn download(&self, job: &DownloadJob) -> DownloadResult<PathBuf> {
        self.download_with_progress(job, None, &CancellationToken::new())
            .await
    }

    /// Downloads `job`, reporting to `progress` and stopping when `cancel` fires.
    pub async fn download_with_progress(
        &self,
        job: &DownloadJob,
        progress: Option<mpsc::UnboundedSender<DownloadProgress>>,
        cancel: &CancellationToken,
    ) -> DownloadResult<PathBuf> {
        let mut reporter = ProgressReporter::new(job.id.clone(), progress);
        let result = self.run(job, &mut reporter, cancel).await;

        match &result {
            Ok(_) => {}
            Err(DownloadError::Cancelled) => reporter.send(DownloadProgress::Cancelled {
                id: job.id.clone(),
            }),
            Err(e) => reporter.send(DownloadProgress::Failed {
                id: job.id.clone(),
                error: e.to_string(),
            }),
        }

        result
    }

    async fn run(
        &self,
        job: &DownloadJob,
        reporter: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> DownloadResult<PathBuf> {
        let dir_ok = tokio::fs::metadata(&job.destination_dir)
            .await
            .map(|m| m.is_dir())
            .map_err(|e| DownloadError::io(&job.destination_dir, e))?;
        if !dir_ok {
            return Err(DownloadError::io(
                &job.destination_dir,
                std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
            ));
        }

        // a job that already knows its name can skip without any request
        if let Some(name) = job.file_name() {
            let target = job.destination_dir.join(name);
            if target_exists(&target).await {
                return Ok(self.skip(job, reporter, target));
            }
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = self.engine.fetch(&job.url) => response?,
        };

        let file_name = match job.file_name() {
            Some(name) => name.to_string(),
            None => {
                let resolved = resolve_file_name(response.headers(), &job.url)?;
                job.resolve_file_name_once(resolved).to_string()
            }
        };
        let target = job.destination_dir.join(&file_name);

        if target_exists(&target).await {
            // skip-if-present: the body is never read
            drop(response);
            return Ok(self.skip(job, reporter, target));
        }

        let strategy = self.strategy();
        debug!("Job {} uses {:?}", job.id, strategy);
        reporter.send(DownloadProgress::Started {
            id: job.id.clone(),
            url: job.url.to_string(),
            output_path: target.clone(),
            strategy: strategy.clone(),
        });

        let bytes_downloaded = match strategy {
            Strategy::Builtin => {
                self.engine
                    .stream_to_file(response, &target, reporter, cancel)
                    .await?
            }
            Strategy::Delegated { program } => {
                drop(response);
                let client = Aria2Client::with_program(program, &self.settings);
                client.download(job, &file_name, reporter, cancel).await?;
                tokio::fs::metadata(&target)
                    .await
                    .map(|m| m.len())
                    .map_err(|e| DownloadError::io(&target, e))?
            }
        };

        info!(
            "Downloaded {} ({} bytes) to {}",
            job.url,
            bytes_downloaded,
            target.display()
        );
        reporter.send(DownloadProgress::Completed {
            id: job.id.clone(),
            output_path: target.clone(),
            bytes_downloaded,
        });

        Ok(target)
    }

    fn skip(&self, job: &DownloadJob, reporter: &ProgressReporter, target: PathBuf) -> PathBuf {
        info!("{} already exists, skipping download", target.display());
        reporter.send(DownloadProgress::Skipped {
            id: job.id.clone(),
            output_path: target.clone(),
        });
        target
    }
}

async fn target_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
