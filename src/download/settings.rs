use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a delegated job is handed to aria2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DelegationMode {
    /// One-shot process reading an `--input-file` manifest.
    #[default]
    Manifest,
    /// JSON-RPC control channel on a loopback port, polled for status.
    Rpc,
}

/// Transfer settings handed to the downloader by value.
///
/// The download core only ever reads these; they live in the `[aria2]` section of
/// the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub mode: DelegationMode,
    #[serde(default = "default_retry_wait")]
    pub retry_wait: u32,
    #[serde(default = "default_split")]
    pub split: u32,
    #[serde(default = "default_max_connection_per_server")]
    pub max_connection_per_server: u32,
    #[serde(default = "default_min_split_size")]
    pub min_split_size: String,
    #[serde(default)]
    pub extra_options: Vec<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Whole-request timeout for the built-in transfer; 0 disables it.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_program() -> String {
    "aria2c".to_string()
}
fn default_retry_wait() -> u32 {
    2
}
fn default_split() -> u32 {
    5
}
fn default_max_connection_per_server() -> u32 {
    5
}
fn default_min_split_size() -> String {
    "5M".to_string()
}
pub fn default_user_agent() -> String {
    format!("mcst/{}", env!("CARGO_PKG_VERSION"))
}
fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            program: default_program(),
            mode: DelegationMode::default(),
            retry_wait: default_retry_wait(),
            split: default_split(),
            max_connection_per_server: default_max_connection_per_server(),
            min_split_size: default_min_split_size(),
            extra_options: Vec::new(),
            user_agent: default_user_agent(),
            timeout_secs: 0,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl DownloadSettings {
    pub fn with_delegation(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_mode(mut self, mode: DelegationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// RPC status polling interval, clamped to 10ms..=1s.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.clamp(10, 1000))
    }
}
