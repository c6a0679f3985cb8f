//! Tracing subscriber setup shared by the binaries
//!
//! Console output goes to stderr; stdout is left for operator-facing text such as
//! CSR dumps and verification reports.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogFormat, LogTarget, LoggingConfig};

/// Initialize the logging/tracing infrastructure
///
/// `default_prefix` names the log file when the configuration does not, so each
/// tool class appends to its own file. The returned guard must be held until exit.
pub fn init_logging(
    config: &LoggingConfig,
    default_prefix: &str,
    verbose: bool,
) -> Result<Option<WorkerGuard>> {
    let env_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match &config.target {
        LogTarget::Console => {
            init_console_logging(subscriber, &config.format)?;
            Ok(None)
        }
        LogTarget::File => match create_file_writer(config, default_prefix) {
            Ok((writer, guard)) => {
                init_file_logging(subscriber, &config.format, writer)?;
                Ok(Some(guard))
            }
            Err(e) => {
                eprintln!("Warning: {:#}; logging to console instead", e);
                init_console_logging(subscriber, &config.format)?;
                Ok(None)
            }
        },
        LogTarget::Both => match create_file_writer(config, default_prefix) {
            Ok((writer, guard)) => {
                init_both_logging(subscriber, &config.format, writer)?;
                Ok(Some(guard))
            }
            Err(e) => {
                eprintln!("Warning: {:#}; logging to console only", e);
                init_console_logging(subscriber, &config.format)?;
                Ok(None)
            }
        },
    }
}

/// Create an append-only (or daily rotated) file writer
fn create_file_writer(
    config: &LoggingConfig,
    default_prefix: &str,
) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", config.log_dir))?;

    let prefix = config.log_prefix.as_deref().unwrap_or(default_prefix);
    let rotation = if config.daily_rotation {
        Rotation::DAILY
    } else {
        Rotation::NEVER
    };

    let appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(&config.log_dir)
        .with_context(|| format!("Failed to open log file in {:?}", config.log_dir))?;

    Ok(tracing_appender::non_blocking(appender))
}

/// Initialize console-only logging
fn init_console_logging<S>(subscriber: S, format: &LogFormat) -> Result<()>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
{
    let result = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    result.context("Failed to install tracing subscriber")
}

/// Initialize file-only logging
fn init_file_logging<S>(subscriber: S, format: &LogFormat, writer: NonBlocking) -> Result<()>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
{
    let result = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_target(true).with_writer(writer))
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .try_init(),
    };

    result.context("Failed to install tracing subscriber")
}

/// Initialize both console and file logging
fn init_both_logging<S>(subscriber: S, format: &LogFormat, writer: NonBlocking) -> Result<()>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
{
    let result = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr)) // Console
            .with(fmt::layer().json().with_target(true).with_writer(writer)) // File
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .try_init(),
    };

    result.context("Failed to install tracing subscriber")
}
