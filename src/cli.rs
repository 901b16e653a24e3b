use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mcst")]
#[command(about = "Download Minecraft server cores and launch them")]
#[command(long_about = "
mcst downloads Minecraft server core jars, keeps a local server profile (heap
sizes, encoding, launch arguments) and starts the configured Java process.
Downloads run in-process or are handed to aria2c when it is enabled and installed.

Examples:
  mcst download https://mirror.example/paper-1.21.jar
  mcst download --aria2 -o ./cores <URL> <URL>
  mcst cores list
  mcst config set server.max_memory 4G
  mcst launch
")]
#[command(version)]
pub struct Cli {
    /// Override config file path
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download one or more server cores
    #[command(visible_alias = "dl")]
    Download {
        /// Direct download URLs
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,

        /// Download directory override
        #[arg(short, long, value_name = "DIR")]
        #[arg(help = "Download to specific directory (defaults to general.download_dir)")]
        output_dir: Option<PathBuf>,

        /// File name override (single URL only)
        #[arg(short, long, value_name = "NAME")]
        name: Option<String>,

        /// Force delegation to aria2c for this run
        #[arg(long, conflicts_with = "no_aria2")]
        aria2: bool,

        /// Never delegate to aria2c for this run
        #[arg(long)]
        no_aria2: bool,

        /// Drive aria2c over its JSON-RPC interface instead of an input file
        #[arg(long)]
        rpc: bool,

        /// Maximum concurrent downloads
        #[arg(short = 'j', long, value_name = "N")]
        max_concurrent: Option<u8>,
    },

    /// Manage downloaded cores
    Cores {
        #[command(subcommand)]
        action: CoresAction,
    },

    /// Manage configuration
    #[command(visible_alias = "cfg")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Start the server with the selected core
    #[command(visible_alias = "run")]
    Launch {
        /// Print the Java command without running it
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
pub enum CoresAction {
    /// List recorded cores
    #[command(visible_alias = "ls")]
    List,

    /// Select the core used by `launch`
    Use {
        /// Index shown by `cores list`
        index: usize,
    },

    /// Forget a recorded core
    #[command(visible_alias = "rm")]
    Remove {
        /// Index shown by `cores list`
        index: usize,

        /// Also delete the jar file
        #[arg(long)]
        delete: bool,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Print the config file location
    Path,

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., aria2.enabled)
        key: String,

        /// Configuration value
        value: String,
    },

    /// Reset configuration to defaults
    Reset {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

impl Cli {
    /// Validate CLI arguments and show helpful error messages
    pub fn validate(&self) -> Result<(), String> {
        if let Commands::Download {
            urls,
            name,
            max_concurrent,
            ..
        } = &self.command
        {
            if name.is_some() && urls.len() > 1 {
                return Err("--name can only be used with a single URL".to_string());
            }
            if matches!(max_concurrent, Some(0)) {
                return Err("Max concurrent downloads must be greater than 0".to_string());
            }
        }
        Ok(())
    }

    /// Commands that must run even when the config does not validate
    pub fn skips_config_validation(&self) -> bool {
        matches!(
            self.command,
            Commands::Config {
                action: ConfigAction::Reset { .. } | ConfigAction::Path | ConfigAction::Set { .. }
            }
        )
    }
}
