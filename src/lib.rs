pub mod config;
pub mod download;
pub mod server;

pub use config::ConfigManager;
pub use download::{
    DownloadError, DownloadJob, DownloadManager, DownloadProgress, DownloadSettings, Downloader,
};
pub use server::JavaCommand;
