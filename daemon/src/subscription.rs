/// Registration of the notification context for each event category.
///
/// Each category is attempted exactly once, independently of the others. A
/// failed registration is reported as a single warning and the daemon keeps
/// running without that category.
use std::fmt;

use crate::audit::{AuditLog, LogSink};
use crate::dispatcher::NotificationContext;

/// A subscribable notification category. Volume changes arrive implicitly
/// through the device-interface registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Clipboard,
    DeviceInterface,
}

impl Category {
    /// Registration order used at startup.
    pub const ALL: [Category; 2] = [Category::Clipboard, Category::DeviceInterface];

    fn label(self) -> &'static str {
        match self {
            Category::Clipboard => "clipboard listener",
            Category::DeviceInterface => "device notifications",
        }
    }

    fn success_message(self) -> &'static str {
        match self {
            Category::Clipboard => "Successfully registered clipboard listener.",
            Category::DeviceInterface => "Successfully registered for device notifications.",
        }
    }

    fn degraded_consequence(self) -> &'static str {
        match self {
            Category::Clipboard => "Copy/Paste events will not be logged.",
            Category::DeviceInterface => "USB/Device events will not be logged.",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A platform error code together with the OS-provided description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsError {
    pub code: u32,
    pub message: String,
}

impl OsError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Code: {})", self.message.trim_end(), self.code)
    }
}

impl std::error::Error for OsError {}

/// Outcome of one registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionResult {
    pub category: Category,
    pub error: Option<OsError>,
}

impl SubscriptionResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Attempts every category in [`Category::ALL`] and logs each outcome.
pub fn subscribe_all<C, S>(context: &mut C, log: &mut AuditLog<S>) -> Vec<SubscriptionResult>
where
    C: NotificationContext,
    S: LogSink,
{
    Category::ALL
        .iter()
        .map(|&category| {
            let result = SubscriptionResult {
                category,
                error: context.subscribe(category).err(),
            };
            report(&result, log);
            result
        })
        .collect()
}

fn report<S: LogSink>(result: &SubscriptionResult, log: &mut AuditLog<S>) {
    match &result.error {
        None => log.info(result.category.success_message()),
        Some(err) => log.info(&format!(
            "WARNING: Failed to register {}: {err}. {}",
            result.category,
            result.category.degraded_consequence()
        )),
    }
}
