//! Structured logging for foreman.
//!
//! All modules log through `tracing` macros. This module installs the
//! subscriber once per process:
//! - `RUST_LOG` wins when set
//! - otherwise INFO, or DEBUG when debug mode is on
//!
//! Debug mode can be enabled with `--debug` flag or `FOREMAN_DEBUG=1` env var.
//! The orchestrator daemon logs to `~/.foreman/foreman.log`; one-shot commands
//! log to stderr so their JSON output on stdout stays clean.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
}

/// Initialize stderr logging.
pub fn init() {
    init_with_debug(false, LogTarget::Stderr);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init_with_debug(debug: bool, target: LogTarget) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let default_level = if debug_enabled { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true);

    match target {
        LogTarget::File(path) => {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            // Truncate file on startup
            match File::create(&path) {
                Ok(file) => {
                    builder
                        .with_ansi(false)
                        .with_writer(Mutex::new(file))
                        .try_init()
                        .ok();
                }
                Err(_) => {
                    builder.with_writer(std::io::stderr).try_init().ok();
                }
            }
        }
        LogTarget::Stderr => {
            builder.with_writer(std::io::stderr).try_init().ok();
        }
    }

    tracing::debug!(debug = debug_enabled, "logging initialised");
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    parse_debug_flag(std::env::var("FOREMAN_DEBUG").ok().as_deref())
}

fn parse_debug_flag(value: Option<&str>) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
