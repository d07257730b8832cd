/// The single synchronous dispatch loop.
///
/// One signal is taken from the [`NotificationContext`], fully classified and
/// written to the audit log before the next one is requested, so log order is
/// exactly delivery order. There is no internal queue; back-pressure stays
/// with the OS.
use crate::audit::{AuditLog, LogSink};
use crate::classifier::{self, RawDeviceNotification};
use crate::event::{EventKind, NotificationEvent};
use crate::subscription::{self, Category, OsError, SubscriptionResult};

/// A raw notification as delivered by the notification context.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(not(windows), allow(dead_code))]
pub enum Signal {
    ClipboardUpdate,
    DeviceChange(RawDeviceNotification),
    /// Explicit destroy/quit; carries the process exit code.
    Terminate { exit_code: i32 },
}

/// The OS notification subsystem as seen by the engine.
pub trait NotificationContext {
    /// Installs this context as the recipient of `category` notifications.
    fn subscribe(&mut self, category: Category) -> Result<(), OsError>;

    /// Best-effort removal; the outcome is not checked.
    fn unsubscribe(&mut self, category: Category);

    /// Blocks until the next signal arrives. There is no timeout.
    fn next_signal(&mut self) -> Signal;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Everything the loop owns for the lifetime of the process.
pub struct EngineState<C: NotificationContext> {
    context: C,
    phase: Phase,
    subscriptions: Vec<SubscriptionResult>,
}

impl<C: NotificationContext> EngineState<C> {
    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    fn subscribed(&self, category: Category) -> bool {
        self.subscriptions
            .iter()
            .any(|r| r.category == category && r.succeeded())
    }
}

pub struct Dispatcher<C: NotificationContext> {
    state: EngineState<C>,
}

impl<C: NotificationContext> Dispatcher<C> {
    pub fn new(context: C) -> Self {
        Self {
            state: EngineState {
                context,
                phase: Phase::Starting,
                subscriptions: Vec::new(),
            },
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Attempts every subscription and enters `Running`, whatever the
    /// individual outcomes were.
    pub fn start<S: LogSink>(&mut self, log: &mut AuditLog<S>) -> &[SubscriptionResult] {
        if self.state.phase == Phase::Starting {
            self.state.subscriptions = subscription::subscribe_all(&mut self.state.context, log);
            self.state.phase = Phase::Running;
            log.info("Starting message loop. Monitoring active...");
        }
        &self.state.subscriptions
    }

    /// Runs until a termination signal and returns the exit code it carried.
    ///
    /// Calls [`Dispatcher::start`] first if that has not happened yet.
    pub fn run<S: LogSink>(&mut self, log: &mut AuditLog<S>) -> i32 {
        self.start(log);

        let mut exit_code = 0;
        while self.state.is_running() {
            let signal = self.state.context.next_signal();
            if let Some(code) = self.dispatch(signal, log) {
                exit_code = code;
            }
        }

        self.stop(log);
        exit_code
    }

    /// Handles one signal. Returns the exit code once termination is requested.
    fn dispatch<S: LogSink>(&mut self, signal: Signal, log: &mut AuditLog<S>) -> Option<i32> {
        match signal {
            Signal::ClipboardUpdate => {
                log.event(&NotificationEvent::now(EventKind::ClipboardChanged));
                None
            }
            Signal::DeviceChange(raw) => {
                if let Some(kind) = classifier::classify(&raw) {
                    log.event(&NotificationEvent::now(kind));
                }
                None
            }
            Signal::Terminate { exit_code } => {
                log.info(&format!(
                    "Termination signal received (exit code {exit_code}), stopping message loop."
                ));
                self.state.phase = Phase::Stopping;
                Some(exit_code)
            }
        }
    }

    /// The device subscription is left to context teardown.
    fn stop<S: LogSink>(&mut self, log: &mut AuditLog<S>) {
        self.state.phase = Phase::Stopping;
        log.info("--- SecurityMonitor Stopping ---");
        if self.state.subscribed(Category::Clipboard) {
            self.state.context.unsubscribe(Category::Clipboard);
        }
        self.state.phase = Phase::Stopped;
    }

    #[cfg(test)]
    pub fn context(&self) -> &C {
        &self.state.context
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedContext;
    use super::*;
    use crate::audit::testing::MemorySink;
    use crate::classifier::{
        DevicePayload, ACTION_ARRIVAL, ACTION_REMOVE_COMPLETE, DEVICE_TYPE_INTERFACE,
    };
    use crate::config::DEFAULT_TIMESTAMP_FORMAT;
    use crate::event::{ClassGuid, USB_DEVICE_INTERFACE_CLASS};
    use chrono::NaiveDateTime;

    const PREFIX_LEN: usize = 22;
    const SUBSCRIBED_AND_STARTED: [&str; 3] = [
        "Successfully registered clipboard listener.",
        "Successfully registered for device notifications.",
        "Starting message loop. Monitoring active...",
    ];

    fn new_log() -> AuditLog<MemorySink> {
        AuditLog::new(MemorySink::default(), DEFAULT_TIMESTAMP_FORMAT)
    }

    fn usb(action: u32, path: &str) -> Signal {
        Signal::DeviceChange(RawDeviceNotification {
            action,
            payload: DevicePayload::Interface {
                class: USB_DEVICE_INTERFACE_CLASS,
                name: path.encode_utf16().collect(),
            },
        })
    }

    fn volume(action: u32, unit_mask: u32) -> Signal {
        Signal::DeviceChange(RawDeviceNotification {
            action,
            payload: DevicePayload::Volume { unit_mask },
        })
    }

    const QUIT: Signal = Signal::Terminate { exit_code: 0 };

    /// Runs `script` to completion and returns the log messages after startup.
    fn run_script(script: Vec<Signal>) -> (i32, Vec<String>) {
        let mut dispatcher = Dispatcher::new(ScriptedContext::new(script));
        let mut log = new_log();
        let code = dispatcher.run(&mut log);
        let messages = log.sink().messages(PREFIX_LEN)[SUBSCRIBED_AND_STARTED.len()..]
            .iter()
            .map(|m| m.to_string())
            .collect();
        (code, messages)
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    #[test]
    fn new_dispatcher_is_starting() {
        let dispatcher = Dispatcher::new(ScriptedContext::new(vec![]));
        assert_eq!(dispatcher.phase(), Phase::Starting);
        assert!(!dispatcher.state.is_running());
    }

    #[test]
    fn start_enters_running_and_logs_registrations() {
        let mut dispatcher = Dispatcher::new(ScriptedContext::new(vec![]));
        let mut log = new_log();
        let results = dispatcher.start(&mut log).to_vec();

        assert_eq!(results.len(), 2);
        assert_eq!(dispatcher.phase(), Phase::Running);
        assert!(dispatcher.state.is_running());
        assert_eq!(log.sink().messages(PREFIX_LEN), SUBSCRIBED_AND_STARTED.to_vec());
    }

    #[test]
    fn start_is_idempotent() {
        let mut dispatcher = Dispatcher::new(ScriptedContext::new(vec![]));
        let mut log = new_log();
        dispatcher.start(&mut log);
        dispatcher.start(&mut log);
        assert_eq!(dispatcher.context().subscribed.len(), 2);
        assert_eq!(log.sink().lines.len(), 3);
    }

    #[test]
    fn all_failures_still_reach_running() {
        let ctx = ScriptedContext::new(vec![QUIT])
            .failing(Category::Clipboard, OsError::new(5, "denied"))
            .failing(Category::DeviceInterface, OsError::new(5, "denied"));
        let mut dispatcher = Dispatcher::new(ctx);
        let mut log = new_log();
        dispatcher.start(&mut log);
        assert_eq!(dispatcher.phase(), Phase::Running);
        assert_eq!(dispatcher.run(&mut log), 0);
    }

    // ── end-to-end scenarios ──────────────────────────────────────────────────

    #[test]
    fn clipboard_signal_logs_one_timestamped_event() {
        let mut dispatcher =
            Dispatcher::new(ScriptedContext::new(vec![Signal::ClipboardUpdate, QUIT]));
        let mut log = new_log();
        dispatcher.run(&mut log);

        let clipboard: Vec<&String> = log
            .sink()
            .lines
            .iter()
            .filter(|l| l.ends_with("Clipboard content changed (Copy/Paste detected)."))
            .collect();
        assert_eq!(clipboard.len(), 1);
        assert!(
            NaiveDateTime::parse_from_str(&clipboard[0][..PREFIX_LEN], DEFAULT_TIMESTAMP_FORMAT)
                .is_ok(),
            "bad timestamp prefix: {}",
            clipboard[0]
        );
    }

    #[test]
    fn usb_arrival_logs_exact_path() {
        let (_, messages) = run_script(vec![usb(ACTION_ARRIVAL, r"\\?\USB#VID_1234"), QUIT]);
        assert_eq!(messages[0], r"USB Device Plugged In: \\?\USB#VID_1234");
    }

    #[test]
    fn volume_arrival_bit_two_logs_drive_c() {
        let (_, messages) = run_script(vec![volume(ACTION_ARRIVAL, 0b100), QUIT]);
        assert_eq!(messages[0], r"Volume/Drive Mounted: C:\");
    }

    #[test]
    fn termination_stops_loop_and_returns_code() {
        let script = vec![Signal::ClipboardUpdate, Signal::Terminate { exit_code: 3 }];
        let mut dispatcher = Dispatcher::new(ScriptedContext::new(script));
        let mut log = new_log();

        assert_eq!(dispatcher.run(&mut log), 3);
        assert_eq!(dispatcher.phase(), Phase::Stopped);
        assert!(!dispatcher.state.is_running());

        let messages = log.sink().messages(PREFIX_LEN);
        let tail = &messages[messages.len() - 2..];
        assert_eq!(
            tail,
            [
                "Termination signal received (exit code 3), stopping message loop.",
                "--- SecurityMonitor Stopping ---",
            ]
        );
        assert_eq!(dispatcher.context().unsubscribed, vec![Category::Clipboard]);
    }

    #[test]
    fn signals_after_termination_are_not_consumed() {
        let script = vec![QUIT, Signal::ClipboardUpdate];
        let mut dispatcher = Dispatcher::new(ScriptedContext::new(script));
        let mut log = new_log();
        dispatcher.run(&mut log);
        assert_eq!(dispatcher.context().delivered, 1);
    }

    // ── routing ───────────────────────────────────────────────────────────────

    #[test]
    fn ignored_actions_emit_nothing() {
        // DBT_DEVNODES_CHANGED
        let (_, messages) = run_script(vec![volume(0x0007, 0b1), QUIT]);
        assert_eq!(messages.len(), 2, "only the shutdown lines: {messages:?}");
    }

    #[test]
    fn unknown_device_type_is_logged_as_unrecognized() {
        let raw = RawDeviceNotification {
            action: ACTION_ARRIVAL,
            payload: DevicePayload::Other { device_type: 0x3 },
        };
        let (_, messages) = run_script(vec![Signal::DeviceChange(raw), QUIT]);
        assert_eq!(
            messages[0],
            "Unrecognized device change (action=0x8000, device type=0x00000003)"
        );
    }

    #[test]
    fn events_are_logged_in_delivery_order() {
        let mut script = Vec::new();
        let mut expected = Vec::new();
        for i in 0..50u32 {
            match i % 4 {
                0 => {
                    script.push(Signal::ClipboardUpdate);
                    expected.push("Clipboard content changed (Copy/Paste detected).".to_string());
                }
                1 => {
                    let path = format!(r"\\?\USB#VID_{i:04}");
                    script.push(usb(ACTION_ARRIVAL, &path));
                    expected.push(format!("USB Device Plugged In: {path}"));
                }
                2 => {
                    let bit = i % 26;
                    script.push(volume(ACTION_REMOVE_COMPLETE, 1 << bit));
                    let letter = char::from(b'A' + bit as u8);
                    expected.push(format!("Volume/Drive Removed: {letter}:\\"));
                }
                _ => {
                    let path = format!(r"\\?\HID#{i}");
                    script.push(Signal::DeviceChange(RawDeviceNotification {
                        action: ACTION_REMOVE_COMPLETE,
                        payload: DevicePayload::Interface {
                            class: ClassGuid(u128::from(i)),
                            name: path.encode_utf16().collect(),
                        },
                    }));
                    expected.push(format!(
                        "Non-USB Device Interface Removal: {path} [class {}]",
                        ClassGuid(u128::from(i))
                    ));
                }
            }
        }
        script.push(QUIT);

        let (_, messages) = run_script(script);
        assert_eq!(&messages[..expected.len()], expected.as_slice());
    }

    // ── degraded mode ─────────────────────────────────────────────────────────

    #[test]
    fn device_registration_failure_keeps_clipboard_events() {
        let ctx = ScriptedContext::new(vec![
            Signal::ClipboardUpdate,
            Signal::ClipboardUpdate,
            QUIT,
        ])
        .failing(Category::DeviceInterface, OsError::new(1066, "Service error."));
        let mut dispatcher = Dispatcher::new(ctx);
        let mut log = new_log();
        dispatcher.run(&mut log);

        let messages = log.sink().messages(PREFIX_LEN);
        let warnings: Vec<_> = messages.iter().filter(|m| m.starts_with("WARNING")).collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("device notifications"));
        assert_eq!(
            messages
                .iter()
                .filter(|m| m.starts_with("Clipboard content changed"))
                .count(),
            2
        );
        assert_eq!(dispatcher.context().unsubscribed, vec![Category::Clipboard]);
    }

    #[test]
    fn clipboard_is_not_unsubscribed_when_never_registered() {
        let ctx = ScriptedContext::new(vec![QUIT])
            .failing(Category::Clipboard, OsError::new(5, "denied"));
        let mut dispatcher = Dispatcher::new(ctx);
        let mut log = new_log();
        dispatcher.run(&mut log);
        assert!(dispatcher.context().unsubscribed.is_empty());
    }

    #[test]
    fn sink_failures_do_not_stop_the_loop() {
        use crate::audit::testing::FailingSink;

        let script = vec![
            Signal::ClipboardUpdate,
            usb(ACTION_ARRIVAL, "p"),
            Signal::Terminate { exit_code: 0 },
        ];
        let mut dispatcher = Dispatcher::new(ScriptedContext::new(script));
        let mut log = AuditLog::new(FailingSink::default(), DEFAULT_TIMESTAMP_FORMAT);

        assert_eq!(dispatcher.run(&mut log), 0);
        assert_eq!(dispatcher.phase(), Phase::Stopped);
        // 2 registrations + start + 2 events + 2 shutdown lines
        assert_eq!(log.sink().attempts, 7);
    }

    #[test]
    fn truncated_interface_header_is_logged() {
        let raw = RawDeviceNotification {
            action: ACTION_REMOVE_COMPLETE,
            payload: DevicePayload::Truncated { device_type: DEVICE_TYPE_INTERFACE },
        };
        let (_, messages) = run_script(vec![Signal::DeviceChange(raw), QUIT]);
        assert_eq!(
            messages[0],
            "Unrecognized device change (action=0x8004, device type=0x00000005)"
        );
    }
}
