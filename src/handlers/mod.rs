pub mod config;
pub mod cores;
pub mod download;
pub mod launch;

pub use config::handle_config;
pub use cores::handle_cores;
pub use download::{DownloadArgs, handle_download};
pub use launch::handle_launch;
