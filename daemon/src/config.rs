use anyhow::{bail, Context, Result};
use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_LOG_FILE_NAME: &str = "SecurityMonitorLog.txt";
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "[%Y-%m-%d %H:%M:%S] ";

/// Optional settings read from `secmon.toml` next to the executable.
/// Every field has a default, so an absent file changes nothing.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// File name of the audit log, created in the executable's directory.
    pub log_file_name: String,
    /// strftime pattern prefixed to every audit line.
    pub timestamp_format: String,
    /// Mirror every audit line to stdout.
    pub echo_to_console: bool,
    /// Subscribe to the USB device-interface class only instead of all classes.
    pub usb_interfaces_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_file_name: DEFAULT_LOG_FILE_NAME.to_string(),
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
            echo_to_console: true,
            usb_interfaces_only: false,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        let name = self.log_file_name.trim();
        if name.is_empty() {
            bail!("log_file_name must not be empty");
        }
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            bail!("log_file_name must be a plain file name, got '{}'", self.log_file_name);
        }
        if StrftimeItems::new(&self.timestamp_format).any(|item| matches!(item, Item::Error)) {
            bail!("timestamp_format is not a valid strftime pattern: '{}'", self.timestamp_format);
        }
        Ok(())
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read, parsed or validated.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}
