//! Structured logging for archive_fetch.
//!
//! Every run writes a daily-rolling log file (JSON or plain lines) and, optionally,
//! human-readable lines on stderr. `RUST_LOG` overrides the configured level.

use std::env::consts::{ARCH, FAMILY, OS};
use std::path::Path;

use thiserror::Error;
use tracing::{info, trace};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan, time::ChronoUtc},
    prelude::*,
};

use crate::config::Logging;

/// Name of the rolling log file inside the log directory.
pub const LOG_FILE_NAME: &str = "archive_fetch.log";

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

pub type LoggerResult<T> = Result<T, LoggerError>;

/// Keeps the non-blocking file writer alive. Dropping it flushes pending lines.
pub struct Logger {
    _guard: Option<WorkerGuard>,
}

/// Installs the global subscriber.
pub fn init_logger(log_dir: &Path, settings: &Logging) -> LoggerResult<Logger> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    let (file_layer, guard) = if settings.log_to_file {
        std::fs::create_dir_all(log_dir)?;
        let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer = match settings.log_format.as_str() {
            "json" => fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_timer(ChronoUtc::rfc_3339())
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
            _ => fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_timer(ChronoUtc::rfc_3339())
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let terminal_layer = settings.log_to_terminal.then(|| {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(terminal_layer)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = %settings.log_format,
        log_level = %settings.log_level,
        log_dir = %log_dir.display(),
        "Logger initialized"
    );

    Ok(Logger { _guard: guard })
}

/// Logs information about the system being used.
pub fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}
