/// Canonical file paths for secmon data files.
///
/// Both files live next to the running executable:
///   - secmon.toml              Optional settings, read at startup.
///   - SecurityMonitorLog.txt   Append-only audit log (name configurable).
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "secmon.toml";

/// Returns the directory containing the running executable.
pub fn executable_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the running executable")?;
    parent_dir(&exe)
}

fn parent_dir(exe: &Path) -> Result<PathBuf> {
    exe.parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .with_context(|| format!("Executable path has no parent directory: {}", exe.display()))
}

/// Returns `<dir>\secmon.toml`.
pub fn config_file_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE_NAME)
}

/// Returns `<dir>\<log_file_name>`.
pub fn log_file_path(dir: &Path, log_file_name: &str) -> PathBuf {
    dir.join(log_file_name)
}
