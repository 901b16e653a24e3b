use anyhow::Result;
use console::{Term, style};
use mcst::config::ConfigManager;
use mcst::server::JavaCommand;
use std::process;

pub async fn handle_launch(config_manager: &ConfigManager, dry_run: bool) -> Result<()> {
    let term = Term::stdout();
    let command = JavaCommand::from_config(&config_manager.config().server)?;

    if dry_run {
        term.write_line(&command.display())?;
        return Ok(());
    }

    term.write_line(&format!(
        "{} {}",
        style("🚀").green(),
        style(command.display()).dim()
    ))?;
    let status = command.launch().await?;

    if !status.success() {
        term.write_line(&format!(
            "{} Server exited with {}",
            style("❌").red(),
            status
        ))?;
        process::exit(status.code().unwrap_or(1));
    }

    term.write_line(&format!("{} Server stopped", style("✅").green()))?;
    Ok(())
}
