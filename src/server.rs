//! Builds and runs the Java command for the selected server core.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::info;

use crate::config::ServerConfig;
use crate::download::probe_executable;

#[derive(Debug, Clone, PartialEq)]
pub struct JavaCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl JavaCommand {
    /// `java -Xms -Xmx -Dfile.encoding [jvm args] -jar <core> [server args] [nogui]`
    pub fn from_config(server: &ServerConfig) -> Result<Self> {
        let core = server
            .core
            .as_ref()
            .context("No server core selected; download one or run 'mcst cores use <N>'")?;

        let mut args = vec![
            format!("-Xms{}", server.min_memory),
            format!("-Xmx{}", server.max_memory),
            format!("-Dfile.encoding={}", server.encoding),
        ];
        args.extend(server.jvm_args.iter().cloned());
        args.push("-jar".to_string());
        args.push(core.display().to_string());
        args.extend(server.server_args.iter().cloned());
        if server.nogui && !server.server_args.iter().any(|a| a == "nogui") {
            args.push("nogui".to_string());
        }

        let working_dir = core
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            program: server.java_path.clone(),
            args,
            working_dir,
        })
    }

    /// Shell-like rendering for display.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|a| {
                if a.contains(char::is_whitespace) {
                    format!("\"{a}\"")
                } else {
                    a.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs the server in the foreground with inherited stdio.
    pub async fn launch(&self) -> Result<ExitStatus> {
        let java = probe_executable(&self.program)
            .with_context(|| format!("Java executable '{}' not found", self.program))?;
        let jar = self
            .args
            .iter()
            .skip_while(|a| *a != "-jar")
            .nth(1)
            .map(PathBuf::from);
        if let Some(jar) = jar.filter(|j| !j.exists()) {
            bail!("Server core {:?} does not exist", jar);
        }

        info!("Launching: {}", self.display());
        let status = Command::new(java)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .context("Failed to start Java")?;

        Ok(status)
    }
}
