use anyhow::{Context, Result, bail};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use mcst::config::ConfigManager;
use mcst::download::{
    DelegationMode, DownloadJob, DownloadManager, DownloadProgress, ProgressTracker, Strategy,
};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct DownloadArgs {
    pub urls: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub name: Option<String>,
    pub aria2: bool,
    pub no_aria2: bool,
    pub rpc: bool,
    pub max_concurrent: Option<u8>,
}

pub async fn handle_download(config_manager: &mut ConfigManager, args: DownloadArgs) -> Result<()> {
    let term = Term::stdout();
    let config = config_manager.config();

    let mut settings = config.aria2.clone();
    if args.aria2 {
        settings.enabled = true;
    }
    if args.no_aria2 {
        settings.enabled = false;
    }
    if args.rpc {
        settings.mode = DelegationMode::Rpc;
    }
    let max_concurrent = args
        .max_concurrent
        .unwrap_or(config.general.max_concurrent_downloads);

    let download_dir = args
        .output_dir
        .unwrap_or_else(|| config_manager.download_dir());
    std::fs::create_dir_all(&download_dir)
        .with_context(|| format!("Failed to create download directory: {:?}", download_dir))?;

    let mut jobs = Vec::with_capacity(args.urls.len());
    for url in &args.urls {
        let mut job = DownloadJob::new(url, &download_dir)?;
        if let Some(name) = &args.name {
            job = job.with_file_name(name.clone())?;
        }
        jobs.push(job);
    }

    term.write_line(&format!(
        "{} Downloading {} core(s) into {}",
        style("⬇️").cyan(),
        jobs.len(),
        style(download_dir.display()).cyan()
    ))?;

    let (manager, progress_rx) = DownloadManager::new(settings, max_concurrent as usize)?;
    let renderer = render_progress(progress_rx);
    let signals = cancel_on_signal(manager.shutdown_token());

    let total = jobs.len();
    let results = manager.download_all(jobs).await;
    drop(manager);
    signals.abort();
    let _ = renderer.await;

    let mut failed = 0;
    for (index, (job, result)) in results.into_iter().enumerate() {
        match result {
            Ok(path) => {
                config_manager
                    .config_mut()
                    .record_core(path.clone(), job.url.to_string());
                term.write_line(&format!(
                    "{} {}",
                    style("✅").green(),
                    style(path.display()).cyan()
                ))?;
            }
            Err(e) => {
                failed += 1;
                term.write_line(&format!(
                    "{} job {} failed: {}",
                    style("❌").red(),
                    index + 1,
                    e
                ))?;
                if e.is_fallback_candidate() {
                    term.write_line(&format!(
                        "{} Retry with --no-aria2 to use the built-in downloader",
                        style("💡").yellow()
                    ))?;
                }
            }
        }
    }

    config_manager.save()?;

    if failed > 0 {
        bail!("{} of {} downloads failed", failed, total);
    }
    Ok(())
}

/// Cancels `token` on Ctrl-C or SIGTERM, which kills any running aria2 child.
fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        debug!("Shutdown signal received, cancelling downloads");
        token.cancel();
    })
}

fn render_progress(mut rx: mpsc::UnboundedReceiver<DownloadProgress>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let multi = MultiProgress::new();
        let mut bars: HashMap<String, ProgressBar> = HashMap::new();
        let bar_style = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({prefix}, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.blue} {msg} {bytes} ({prefix})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        while let Some(event) = rx.recv().await {
            match event {
                DownloadProgress::Started {
                    id,
                    output_path,
                    strategy,
                    ..
                } => {
                    let bar = multi.add(ProgressBar::no_length());
                    bar.set_style(spinner_style.clone());
                    let via = match strategy {
                        Strategy::Builtin => "",
                        Strategy::Delegated { .. } => " via aria2",
                    };
                    let name = output_path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    bar.set_message(format!("{name}{via}"));
                    bars.insert(id, bar);
                }
                DownloadProgress::Progress {
                    id,
                    progress,
                    speed_bps,
                } => {
                    if let Some(bar) = bars.get(&id) {
                        bar.set_prefix(ProgressTracker::format_speed(speed_bps));
                        if let Some(total) = progress.total_bytes {
                            if bar.length() != Some(total) {
                                bar.set_style(bar_style.clone());
                                bar.set_length(total);
                            }
                        }
                        bar.set_position(progress.completed_bytes);
                    }
                }
                DownloadProgress::Skipped { output_path, .. } => {
                    let _ = multi.println(format!(
                        "{} {} already exists, skipped",
                        style("⏭️").yellow(),
                        output_path.display()
                    ));
                }
                DownloadProgress::Completed {
                    id,
                    bytes_downloaded,
                    ..
                } => {
                    if let Some(bar) = bars.remove(&id) {
                        bar.finish_with_message(format!(
                            "done ({})",
                            ProgressTracker::format_bytes(bytes_downloaded)
                        ));
                    }
                }
                DownloadProgress::Failed { id, error } => {
                    if let Some(bar) = bars.remove(&id) {
                        bar.abandon_with_message(format!("failed: {error}"));
                    }
                }
                DownloadProgress::Cancelled { id } => {
                    if let Some(bar) = bars.remove(&id) {
                        bar.abandon_with_message("cancelled");
                    }
                }
            }
        }
    })
}
