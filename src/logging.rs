//! Tracing setup for the `foreman` binary.
//!
//! Diagnostics go to stderr (stdout carries command output). When the
//! project is initialized and file logging is on, a daily-rolling copy is
//! written to `.foreman/logs/foreman.log`.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::ForemanConfig;

/// Keeps the non-blocking file writer flushing until dropped.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Parse a filter directive, falling back to `info` when it is malformed.
pub fn filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(config: &ForemanConfig) -> LogGuard {
    let directive = config.log_filter();
    let mut file_guard = None;

    let file_layer = if config.toml.logging.file && config.is_initialized() {
        let log_dir = config.log_dir();
        match std::fs::create_dir_all(&log_dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(log_dir, "foreman.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                file_guard = Some(guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_filter(filter(&directive)),
                )
            }
            Err(err) => {
                eprintln!("warning: file logging disabled: {}", err);
                None
            }
        }
    } else {
        None
    };

    let console_layer = if config.toml.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter(&directive))
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter(&directive))
            .boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init();

    LogGuard { _file: file_guard }
}
