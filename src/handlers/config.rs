use crate::cli::ConfigAction;
use anyhow::{Context, Result};
use console::{Term, style};
use dialoguer::Confirm;
use mcst::config::ConfigManager;

pub async fn handle_config(config_manager: &mut ConfigManager, action: ConfigAction) -> Result<()> {
    let term = Term::stdout();

    match action {
        ConfigAction::Show => {
            let content = toml::to_string_pretty(config_manager.config())
                .context("Failed to serialize config")?;
            term.write_line(&format!("{} Current configuration:", style("⚙️").cyan()))?;
            term.write_line("")?;
            term.write_line(&content)?;
        }

        ConfigAction::Path => {
            term.write_line(&config_manager.config_file().display().to_string())?;
        }

        ConfigAction::Set { key, value } => {
            config_manager.set_value(&key, &value)?;
            config_manager
                .validate()
                .with_context(|| format!("Refusing to save '{}' = '{}'", key, value))?;
            config_manager.save()?;
            term.write_line(&format!(
                "{} {} = {}",
                style("✅").green(),
                style(&key).cyan(),
                value
            ))?;
        }

        ConfigAction::Reset { yes } => {
            if !yes {
                let confirmed = Confirm::new()
                    .with_prompt("Reset configuration to defaults? Recorded cores are forgotten")
                    .default(false)
                    .interact()?;
                if !confirmed {
                    term.write_line("Aborted")?;
                    return Ok(());
                }
            }
            config_manager.reset()?;
            term.write_line(&format!(
                "{} Configuration reset: {}",
                style("✅").green(),
                config_manager.config_file().display()
            ))?;
        }
    }

    Ok(())
}
