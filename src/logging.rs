//! Tracing setup for the daemon and for one-shot CLI commands.
//!
//! The daemon writes JSON lines to a daily-rotated file next to a readable
//! stderr stream; CLI commands only log to stderr. `RUST_LOG` overrides the
//! configured level in both modes.

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// File name prefix of the rotated daemon log.
const LOG_FILE_PREFIX: &str = "courier.log";

/// Keeps the background log writer alive.
///
/// Dropping it flushes buffered lines, so hold it until the daemon exits.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the daemon subscriber.
///
/// Logs go to `{dir}/courier.log.YYYY-MM-DD` as JSON and to stderr as text.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created.
pub fn init_daemon(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("failed to create logs directory {}", config.dir.display()))?;

    let appender = tracing_appender::rolling::daily(&config.dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_writer(writer),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(LoggingGuard { _guard: guard })
}

/// Install a stderr-only subscriber for short-lived commands.
pub fn init_cli(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
