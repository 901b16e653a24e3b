use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::download::DownloadSettings;

static MEMORY_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-9]\d*[KkMmGg]?$").expect("valid memory size regex"));
static ARIA2_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-9]\d*[KkMm]?$").expect("valid aria2 size regex"));

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub aria2: DownloadSettings,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cores: Vec<CoreEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_java_path")]
    pub java_path: String,
    #[serde(default = "default_min_memory")]
    pub min_memory: String,
    #[serde(default = "default_max_memory")]
    pub max_memory: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub jvm_args: Vec<String>,
    #[serde(default)]
    pub server_args: Vec<String>,
    #[serde(default = "default_nogui")]
    pub nogui: bool,
    /// Selected core jar.
    #[serde(default)]
    pub core: Option<PathBuf>,
}

/// A downloaded server jar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreEntry {
    pub path: PathBuf,
    pub url: String,
    pub downloaded_at: DateTime<Utc>,
}

// Default value functions
fn default_download_dir() -> PathBuf {
    PathBuf::from("cores")
}
fn default_max_concurrent_downloads() -> u8 {
    3
}
fn default_java_path() -> String {
    "java".to_string()
}
fn default_min_memory() -> String {
    "1G".to_string()
}
fn default_max_memory() -> String {
    "2G".to_string()
}
fn default_encoding() -> String {
    "UTF-8".to_string()
}
fn default_nogui() -> bool {
    true
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            java_path: default_java_path(),
            min_memory: default_min_memory(),
            max_memory: default_max_memory(),
            encoding: default_encoding(),
            jvm_args: Vec::new(),
            server_args: Vec::new(),
            nogui: default_nogui(),
            core: None,
        }
    }
}

impl Config {
    /// Records a downloaded core, replacing an older entry for the same path.
    ///
    /// The first recorded core becomes the selected one.
    pub fn record_core(&mut self, path: PathBuf, url: String) {
        self.cores.retain(|c| c.path != path);
        if self.server.core.is_none() {
            self.server.core = Some(path.clone());
        }
        self.cores.push(CoreEntry {
            path,
            url,
            downloaded_at: Utc::now(),
        });
    }

    /// Removes the core at `index`, clearing the selection if it pointed there.
    pub fn remove_core(&mut self, index: usize) -> Option<CoreEntry> {
        if index >= self.cores.len() {
            return None;
        }
        let removed = self.cores.remove(index);
        if self.server.core.as_ref() == Some(&removed.path) {
            self.server.core = None;
        }
        Some(removed)
    }
}

pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Load the config from the default location, creating it on first run
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("", "", "mcst").context("Failed to determine config directory")?;
        Self::from_file(project_dirs.config_dir().join("config.toml"))
    }

    /// Load the config from `config_file`, creating it with defaults if missing
    pub fn from_file(config_file: impl Into<PathBuf>) -> Result<Self> {
        let config_file = config_file.into();
        let config_dir = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        if !config_dir.as_os_str().is_empty() && !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
        }

        let config = if config_file.exists() {
            Self::load_config(&config_file)?
        } else {
            let default_config = Config::default();
            Self::save_config(&config_file, &default_config)?;
            default_config
        };

        Ok(Self {
            config_dir,
            config_file,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save(&self) -> Result<()> {
        Self::save_config(&self.config_file, &self.config)
    }

    pub fn reload(&mut self) -> Result<()> {
        self.config = Self::load_config(&self.config_file)?;
        Ok(())
    }

    /// Reset to defaults and save
    pub fn reset(&mut self) -> Result<()> {
        self.config = Config::default();
        self.save()
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Download directory, resolved against the config directory when relative
    pub fn download_dir(&self) -> PathBuf {
        let dir = &self.config.general.download_dir;
        if dir.is_absolute() {
            dir.clone()
        } else {
            self.config_dir.join(dir)
        }
    }

    /// Set a dotted key such as `server.max_memory` from its string form.
    ///
    /// The value is parsed as a TOML literal first so numbers, booleans and arrays
    /// keep their type, and falls back to a plain string.
    pub fn set_value(&mut self, key: &str, raw: &str) -> Result<()> {
        let mut document =
            toml::Value::try_from(&self.config).context("Failed to serialize config")?;

        let value = toml::from_str::<toml::Table>(&format!("v = {raw}"))
            .ok()
            .and_then(|mut t| t.remove("v"))
            .unwrap_or_else(|| toml::Value::String(raw.to_string()));

        let (path, leaf) = match key.rsplit_once('.') {
            Some((path, leaf)) => (Some(path), leaf),
            None => (None, key),
        };

        let mut table = document
            .as_table_mut()
            .context("Config root is not a table")?;
        for part in path.into_iter().flat_map(|p| p.split('.')) {
            table = table
                .get_mut(part)
                .and_then(toml::Value::as_table_mut)
                .with_context(|| format!("Unknown config section '{}'", part))?;
        }

        // unset Option fields are absent from the serialized form
        if !table.contains_key(leaf) && key != "server.core" {
            bail!("Unknown config key '{}'", key);
        }
        table.insert(leaf.to_string(), value);

        let updated: Config = document
            .try_into()
            .with_context(|| format!("Invalid value '{}' for '{}'", raw, key))?;
        self.config = updated;
        Ok(())
    }

    fn load_config(config_file: &Path) -> Result<Config> {
        let content = fs::read_to_string(config_file)
            .with_context(|| format!("Failed to read config file: {:?}", config_file))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_file))?;

        Ok(config)
    }

    fn save_config(config_file: &Path, config: &Config) -> Result<()> {
        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(config_file, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_file))?;

        Ok(())
    }

    /// Validate the current configuration
    pub fn validate(&self) -> Result<()> {
        let general = &self.config.general;
        if general.max_concurrent_downloads == 0 {
            bail!("general.max_concurrent_downloads must be greater than 0");
        }
        if general.download_dir.as_os_str().is_empty() {
            bail!("general.download_dir cannot be empty");
        }

        let aria2 = &self.config.aria2;
        if aria2.program.trim().is_empty() {
            bail!("aria2.program cannot be empty");
        }
        if aria2.split == 0 {
            bail!("aria2.split must be greater than 0");
        }
        if !(1..=16).contains(&aria2.max_connection_per_server) {
            bail!("aria2.max_connection_per_server must be between 1 and 16");
        }
        if !ARIA2_SIZE.is_match(&aria2.min_split_size) {
            bail!(
                "aria2.min_split_size '{}' is not a size like 5M",
                aria2.min_split_size
            );
        }
        if let Some(bad) = aria2.extra_options.iter().find(|o| !o.starts_with("--")) {
            bail!("aria2.extra_options entry '{}' must start with --", bad);
        }

        let server = &self.config.server;
        for (name, value) in [
            ("server.min_memory", &server.min_memory),
            ("server.max_memory", &server.max_memory),
        ] {
            if !MEMORY_SIZE.is_match(value) {
                bail!("{} '{}' is not a size like 512M or 2G", name, value);
            }
        }
        if server.encoding.trim().is_empty() {
            bail!("server.encoding cannot be empty");
        }

        Ok(())
    }
}
