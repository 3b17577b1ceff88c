//! Logging setup
//!
//! One `tracing` subscriber for the whole process: an `EnvFilter`, a console
//! layer in the selected format and, optionally, a non-blocking file layer.

use crate::config::LogFormat;
use crate::{Error, Result};
use std::path::Path;
use tracing::{Level, Span, field, span};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Build the level filter, falling back to `info` on a bad directive
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped and must be kept
/// alive for the lifetime of the process.
pub fn init_logging(
    level: &str,
    format: LogFormat,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let console = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Plain => fmt::layer().compact().with_target(false).boxed(),
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| Error::config(format!("invalid log file {}", path.display())))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::config(format!("logging already initialised: {}", e)))?;

    Ok(guard)
}

/// Span wrapping everything a miner connection logs
pub fn session_span(session_id: &str, miner: &str, ip: &str) -> Span {
    let span = span!(
        Level::INFO,
        "session",
        session_id = %session_id,
        miner = field::Empty,
        ip = %ip
    );
    if !miner.is_empty() {
        span.record("miner", field::display(miner));
    }
    span
}
