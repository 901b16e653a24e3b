mod cli;
mod handlers;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use handlers::DownloadArgs;
use mcst::config::ConfigManager;
use std::process;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Validate CLI arguments first
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    // Logs go to stderr so progress bars on stdout stay intact
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let mut config_manager = match &args.config {
        Some(path) => ConfigManager::from_file(path)?,
        None => ConfigManager::new()?,
    };

    if !args.skips_config_validation() {
        if let Err(e) = config_manager.validate() {
            eprintln!("Configuration validation failed: {}", e);
            eprintln!("Run 'mcst config set <key> <value>' to fix it");
            eprintln!("Or run 'mcst config reset' to restore defaults");
            process::exit(1);
        }
    }

    match args.command {
        Commands::Download {
            urls,
            output_dir,
            name,
            aria2,
            no_aria2,
            rpc,
            max_concurrent,
        } => {
            handlers::handle_download(
                &mut config_manager,
                DownloadArgs {
                    urls,
                    output_dir,
                    name,
                    aria2,
                    no_aria2,
                    rpc,
                    max_concurrent,
                },
            )
            .await?;
        }
        Commands::Cores { action } => {
            handlers::handle_cores(&mut config_manager, action).await?;
        }
        Commands::Config { action } => {
            handlers::handle_config(&mut config_manager, action).await?;
        }
        Commands::Launch { dry_run } => {
            handlers::handle_launch(&config_manager, dry_run).await?;
        }
    }

    Ok(())
}
