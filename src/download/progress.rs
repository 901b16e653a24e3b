use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::strategy::Strategy;

/// Minimum wall time between two `Progress` events of one job.
pub const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(50);

/// Byte counters of the transfer currently running for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// `None` when the server did not announce a length.
    pub total_bytes: Option<u64>,
    pub completed_bytes: u64,
    /// Only reported under delegation.
    pub active_connections: u32,
}

impl TransferProgress {
    pub fn new(total_bytes: Option<u64>) -> Self {
        Self {
            total_bytes,
            completed_bytes: 0,
            active_connections: 0,
        }
    }

    /// Adds `n` freshly written bytes.
    pub fn advance(&mut self, n: u64) {
        self.observe(self.completed_bytes.saturating_add(n));
    }

    /// Records an absolute completed count.
    ///
    /// Counts never go backwards and never exceed a known total.
    pub fn observe(&mut self, completed: u64) {
        let mut completed = completed.max(self.completed_bytes);
        if let Some(total) = self.total_bytes {
            completed = completed.min(total);
        }
        self.completed_bytes = completed;
    }

    /// Adopts a total reported late (aria2 only learns it after connecting).
    pub fn set_total(&mut self, total: Option<u64>) {
        if let Some(total) = total.filter(|t| *t > 0) {
            self.total_bytes = Some(total.max(self.completed_bytes));
        }
    }

    pub fn percent(&self) -> Option<u8> {
        match self.total_bytes {
            Some(0) => Some(100),
            Some(total) => Some((self.completed_bytes as f64 / total as f64 * 100.0) as u8),
            None => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DownloadProgress {
    Started {
        id: String,
        url: String,
        output_path: PathBuf,
        strategy: Strategy,
    },
    /// The destination already existed; nothing was transferred.
    Skipped {
        id: String,
        output_path: PathBuf,
    },
    Progress {
        id: String,
        progress: TransferProgress,
        speed_bps: u64,
    },
    Completed {
        id: String,
        output_path: PathBuf,
        bytes_downloaded: u64,
    },
    Failed {
        id: String,
        error: String,
    },
    Cancelled {
        id: String,
    },
}

/// Sends progress for one job, at most once per [`PROGRESS_UPDATE_INTERVAL`].
///
/// A closed receiver is ignored: nobody watching is not a transfer failure.
pub struct ProgressReporter {
    id: String,
    sender: Option<mpsc::UnboundedSender<DownloadProgress>>,
    last_update: Instant,
    last_bytes: u64,
}

impl ProgressReporter {
    pub fn new(id: impl Into<String>, sender: Option<mpsc::UnboundedSender<DownloadProgress>>) -> Self {
        Self {
            id: id.into(),
            sender,
            last_update: Instant::now(),
            last_bytes: 0,
        }
    }

    pub fn send(&self, event: DownloadProgress) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    /// Reports `progress` unless the previous report is too recent.
    pub fn update(&mut self, progress: &TransferProgress) {
        if self.last_update.elapsed() >= PROGRESS_UPDATE_INTERVAL {
            self.emit(progress);
        }
    }

    /// Reports `progress` regardless of the throttle.
    pub fn flush(&mut self, progress: &TransferProgress) {
        self.emit(progress);
    }

    fn emit(&mut self, progress: &TransferProgress) {
        let elapsed = self.last_update.elapsed().as_secs_f64();
        let speed_bps = if elapsed > 0.0 {
            (progress.completed_bytes.saturating_sub(self.last_bytes) as f64 / elapsed) as u64
        } else {
            0
        };

        self.send(DownloadProgress::Progress {
            id: self.id.clone(),
            progress: *progress,
            speed_bps,
        });

        self.last_update = Instant::now();
        self.last_bytes = progress.completed_bytes;
    }
}

pub struct ProgressTracker;

impl ProgressTracker {
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.1} {}", size, UNITS[unit_index])
        }
    }

    pub fn format_speed(bytes_per_second: u64) -> String {
        format!("{}/s", Self::format_bytes(bytes_per_second))
    }
}
