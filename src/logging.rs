//! Structured logging for the armitage daemons and one-shot subcommands.
//!
//! Both daemons (`armitage serve` and the `molly` worker) log the same
//! way: JSON lines with daily rotation under a logs directory, named after
//! the service, plus human-readable stderr output. One-shot subcommands
//! (`scan`, `rules check`) skip the file layer entirely. The `RUST_LOG`
//! environment variable overrides the default `info` filter in every mode.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Where log output goes.
pub enum LogSink<'a> {
    /// Daemon mode: rotated `<service>.log.YYYY-MM-DD` JSON files under
    /// `dir`, plus console output on stderr.
    Daemon {
        /// Directory for rotated log files; created if missing.
        dir: &'a Path,
        /// Service name used as the log file prefix.
        service: &'a str,
    },
    /// Console-only, for one-shot subcommands.
    Console,
}

/// Keeps the non-blocking file writer alive.
///
/// Dropping the guard flushes pending entries and closes the file, so the
/// caller must hold it for the lifetime of the process. Console-only
/// setups carry no guard.
pub struct LoggingGuard {
    _file_writer: Option<WorkerGuard>,
}

/// Initialise logging for the chosen sink.
///
/// # Errors
///
/// Returns an error if a daemon sink's logs directory cannot be created.
pub fn init(sink: LogSink<'_>) -> anyhow::Result<LoggingGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_writer = match sink {
        LogSink::Daemon { dir, service } => {
            std::fs::create_dir_all(dir).map_err(|e| {
                anyhow::anyhow!("failed to create logs directory {}: {e}", dir.display())
            })?;
            let appender = tracing_appender::rolling::daily(dir, format!("{service}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            Some(guard)
        }
        LogSink::Console => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            None
        }
    };

    Ok(LoggingGuard {
        _file_writer: file_writer,
    })
}
