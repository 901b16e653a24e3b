use std::path::{Path, PathBuf};

use tracing::warn;

use super::settings::DownloadSettings;

/// How one job moves its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Builtin,
    Delegated { program: PathBuf },
}

impl Strategy {
    pub fn is_delegated(&self) -> bool {
        matches!(self, Self::Delegated { .. })
    }
}

/// Picks the transfer strategy for a job.
///
/// Delegation needs both the setting and a resolved executable. When delegation is
/// enabled but the executable is missing the job falls back to the built-in
/// transfer instead of failing.
pub fn select_strategy(settings: &DownloadSettings, probed: Option<&Path>) -> Strategy {
    match (settings.enabled, probed) {
        (true, Some(program)) => Strategy::Delegated {
            program: program.to_path_buf(),
        },
        (true, None) => {
            warn!(
                "{} not found, falling back to the built-in downloader",
                settings.program
            );
            Strategy::Builtin
        }
        (false, _) => Strategy::Builtin,
    }
}

/// Locates `program` the way a shell would.
///
/// A name containing a path separator is checked as-is; a bare name is looked up
/// in every `PATH` entry.
pub fn probe_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path_env = std::env::var_os("PATH")?;
    std::env::split_paths(&path_env)
        .filter(|dir| !dir.as_os_str().is_empty())
        .flat_map(|dir| executable_names(program).map(move |name| dir.join(name)))
        .find(|path| is_executable(path))
}

fn executable_names(program: &str) -> impl Iterator<Item = String> {
    let windows_exe = (cfg!(windows) && !program.to_ascii_lowercase().ends_with(".exe"))
        .then(|| format!("{program}.exe"));
    std::iter::once(program.to_string()).chain(windows_exe)
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        metadata.is_file()
    }
}
