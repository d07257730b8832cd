mod audit;
mod classifier;
mod config;
mod dispatcher;
mod event;
mod paths;
mod platform;
mod subscription;

use crate::audit::{AuditLog, FileSink};
use crate::dispatcher::Dispatcher;
use crate::platform::MessageWindow;

fn main() {
    // ── Executable directory ──────────────────────────────────────────────────
    let exe_dir = match paths::executable_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("FATAL: Could not determine executable directory: {e:#}");
            std::process::exit(1);
        }
    };

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = config::load_or_default(&paths::config_file_path(&exe_dir)).unwrap_or_else(|e| {
        eprintln!("[config] Error (using defaults): {e:#}");
        config::Config::default()
    });

    // ── Audit log ─────────────────────────────────────────────────────────────
    let log_path = paths::log_file_path(&exe_dir, &config.log_file_name);
    println!("Project Directory (Executable Location): {}", exe_dir.display());
    println!("Log file path: {}", log_path.display());

    let sink = match FileSink::open(&log_path, config.echo_to_console) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("FATAL: {e:#}");
            std::process::exit(1);
        }
    };
    let mut log = AuditLog::new(sink, &config.timestamp_format);
    log.info("--- SecurityMonitor Started ---");
    log.info(&format!("Project Directory: {}", exe_dir.display()));

    // ── Notification context ──────────────────────────────────────────────────
    let window = match MessageWindow::create(config.usb_interfaces_only) {
        Ok(window) => window,
        Err(e) => {
            eprintln!("FATAL: {e}");
            log.error(e.operation, &e.source);
            std::process::exit(1);
        }
    };
    log.info("Message-only window created successfully.");
    window.forward_ctrl_c();

    // ── Dispatch loop ─────────────────────────────────────────────────────────
    let mut dispatcher = Dispatcher::new(window);
    let exit_code = dispatcher.run(&mut log);

    // Releases the window and with it the device subscription.
    drop(dispatcher);
    drop(log);
    std::process::exit(exit_code);
}
