/// Append-only audit log.
///
/// Every line is `<timestamp><message>`, flushed as soon as it is written.
/// A write failure is reported on stderr and the line is dropped; the audit
/// log never takes the daemon down.
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::event::NotificationEvent;
use crate::subscription::OsError;

/// Destination for fully formatted audit lines.
pub trait LogSink {
    fn append(&mut self, line: &str) -> io::Result<()>;

    /// Location shown in write-failure diagnostics.
    fn describe(&self) -> String;
}

/// The on-disk log file, opened in append mode.
pub struct FileSink {
    file: File,
    path: PathBuf,
    /// Console copy of every line; stdout unless replaced in tests.
    echo: Option<Box<dyn Write>>,
}

impl FileSink {
    /// Opens (or creates) `path` for appending.
    pub fn open(path: &Path, echo_to_console: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Could not open log file: {}", path.display()))?;
        let echo: Option<Box<dyn Write>> = if echo_to_console {
            Some(Box::new(io::stdout()))
        } else {
            None
        };
        Ok(Self {
            file,
            path: path.to_path_buf(),
            echo,
        })
    }

    #[cfg(test)]
    fn with_echo(mut self, echo: Box<dyn Write>) -> Self {
        self.echo = Some(echo);
        self
    }
}

impl LogSink for FileSink {
    fn append(&mut self, line: &str) -> io::Result<()> {
        let written = writeln!(self.file, "{line}").and_then(|()| self.file.flush());
        // The file is the record; a closed or broken console is ignored.
        if let Some(echo) = self.echo.as_mut() {
            let _ = writeln!(echo, "{line}").and_then(|()| echo.flush());
        }
        written
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Formats events and operational messages and hands them to a [`LogSink`].
pub struct AuditLog<S: LogSink> {
    sink: S,
    timestamp_format: String,
}

impl<S: LogSink> AuditLog<S> {
    pub fn new(sink: S, timestamp_format: &str) -> Self {
        Self {
            sink,
            timestamp_format: timestamp_format.to_string(),
        }
    }

    /// Records a classified event, stamped with its capture time.
    pub fn event(&mut self, event: &NotificationEvent) {
        let line = self.format_line(&event.captured_at, &event.summary());
        self.write(&line);
    }

    /// Records an operational message, stamped with the current time.
    pub fn info(&mut self, message: &str) {
        let line = self.format_line(&Local::now(), message);
        self.write(&line);
    }

    /// Records a platform failure as `ERROR in <context>: <message> (Code: <code>)`.
    pub fn error(&mut self, context: &str, err: &OsError) {
        self.info(&format!("ERROR in {context}: {err}"));
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn format_line(&self, at: &DateTime<Local>, message: &str) -> String {
        use std::fmt::Write as _;

        let mut line = String::new();
        // A malformed strftime string makes `format` fail at render time.
        if write!(line, "{}", at.format(&self.timestamp_format)).is_err() {
            line.clear();
            line.push_str("[TIMESTAMP_ERROR] ");
        }
        line.push_str(message);
        line
    }

    fn write(&mut self, line: &str) {
        if let Err(e) = self.sink.append(line) {
            let _ = writeln!(
                io::stderr(),
                "[audit] Failed to write to log file '{}': {e}",
                self.sink.describe()
            );
        }
    }
}
