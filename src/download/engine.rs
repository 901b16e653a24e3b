use futures_util::StreamExt;
use reqwest::{Client, Response};
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::error::{DownloadError, DownloadResult};
use super::progress::{ProgressReporter, TransferProgress};
use super::settings::DownloadSettings;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Single-stream HTTP transfer.
pub struct DownloadEngine {
    client: Client,
}

impl DownloadEngine {
    pub fn new(settings: &DownloadSettings) -> DownloadResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(settings.user_agent.as_str());
        if let Some(timeout) = settings.timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(DownloadError::Client)?;

        Ok(Self { client })
    }

    /// Issues the GET and checks the status; the body is left unread.
    pub async fn fetch(&self, url: &Url) -> DownloadResult<Response> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| DownloadError::remote(url.as_str(), None, Some(e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::remote(url.as_str(), Some(status.as_u16()), None));
        }

        Ok(response)
    }

    /// Streams the response body into a newly created file at `path`.
    ///
    /// The file must not exist yet. On a failed or cancelled transfer the bytes
    /// written so far stay on disk.
    pub async fn stream_to_file(
        &self,
        response: Response,
        path: &Path,
        reporter: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> DownloadResult<u64> {
        let mut progress = TransferProgress::new(response.content_length());

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| DownloadError::io(path, e))?;

        let mut stream = response.bytes_stream();
        reporter.flush(&progress);

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = file.flush().await;
                    return Err(DownloadError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.map_err(|e| {
                DownloadError::interrupted(path, std::io::Error::new(ErrorKind::ConnectionAborted, e))
            })?;

            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::interrupted(path, e))?;

            progress.advance(chunk.len() as u64);
            reporter.update(&progress);
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::interrupted(path, e))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::interrupted(path, e))?;

        reporter.flush(&progress);
        Ok(progress.completed_bytes)
    }
}
