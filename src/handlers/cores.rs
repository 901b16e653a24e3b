use crate::cli::CoresAction;
use anyhow::{Context, Result};
use console::{Term, style};
use dialoguer::Confirm;
use mcst::config::ConfigManager;
use std::process;

pub async fn handle_cores(config_manager: &mut ConfigManager, action: CoresAction) -> Result<()> {
    let term = Term::stdout();

    match action {
        CoresAction::List => {
            let config = config_manager.config();
            if config.cores.is_empty() {
                term.write_line(&format!(
                    "{} No cores downloaded yet. Try 'mcst download <URL>'",
                    style("📭").yellow()
                ))?;
                return Ok(());
            }

            term.write_line(&format!("{} Downloaded cores:", style("📦").cyan()))?;
            for (index, core) in config.cores.iter().enumerate() {
                let selected = config.server.core.as_ref() == Some(&core.path);
                let marker = if selected {
                    style("*").green().bold().to_string()
                } else {
                    " ".to_string()
                };
                let missing = if core.path.exists() {
                    String::new()
                } else {
                    format!(" {}", style("(missing)").red())
                };
                term.write_line(&format!(
                    "{} [{}] {}{}",
                    marker,
                    index,
                    style(core.path.display()).cyan(),
                    missing
                ))?;
                term.write_line(&format!(
                    "       {} {}  {}",
                    style("from").dim(),
                    core.url,
                    style(core.downloaded_at.format("%Y-%m-%d %H:%M")).dim()
                ))?;
            }
        }

        CoresAction::Use { index } => {
            let config = config_manager.config_mut();
            let Some(core) = config.cores.get(index) else {
                term.write_line(&format!("{} No core at index {}", style("❌").red(), index))?;
                process::exit(1);
            };
            let path = core.path.clone();
            config.server.core = Some(path.clone());
            config_manager.save()?;
            term.write_line(&format!(
                "{} Selected {}",
                style("✅").green(),
                style(path.display()).cyan()
            ))?;
        }

        CoresAction::Remove { index, delete, yes } => {
            let Some(core) = config_manager.config().cores.get(index).cloned() else {
                term.write_line(&format!("{} No core at index {}", style("❌").red(), index))?;
                process::exit(1);
            };

            if delete && !yes {
                let confirmed = Confirm::new()
                    .with_prompt(format!("Delete {}?", core.path.display()))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    term.write_line("Aborted")?;
                    return Ok(());
                }
            }

            if delete && core.path.exists() {
                std::fs::remove_file(&core.path)
                    .with_context(|| format!("Failed to delete {:?}", core.path))?;
            }

            config_manager.config_mut().remove_core(index);
            config_manager.save()?;
            term.write_line(&format!(
                "{} Removed {}",
                style("🗑️").green(),
                style(core.path.display()).cyan()
            ))?;
        }
    }

    Ok(())
}
