//! fleet-certs - certificate lifecycle for an internal service fleet
//!
//! Requests certificates from the internal CA (falling back through every known
//! endpoint and encoding, then to the operator), issues self-signed or Tailscale
//! certificates, installs them into the configured stores and fronts each service
//! with a reverse-proxy site.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info};

use fleet_certs::cli::Cli;
use fleet_certs::commands;
use fleet_certs::logging::init_logging;
use fleet_certs::utils::error::CertError;
use fleet_certs::AppConfig;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load configuration first (before logging, so we know the log target)
    let config = match AppConfig::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    // The guard must be kept alive so buffered log lines reach the file
    let _log_guard = match init_logging(&config.logging, "fleet-certs", cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(1);
        }
    };

    debug!("fleet-certs {} starting", env!("CARGO_PKG_VERSION"));

    // Dropping the command future on Ctrl-C removes the scoped workspace and lock
    let result = runtime.block_on(async {
        tokio::select! {
            result = commands::execute(&cli, config) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, cleaning up");
                Err(CertError::Interrupted)
            }
        }
    });
    runtime.shutdown_timeout(Duration::from_millis(250));

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let report = e.report();
            eprintln!("Error: {}", report.message);
            if let Some(ref hint) = report.hint {
                eprintln!("Hint: {}", hint);
            }
            ExitCode::from(report.exit_code)
        }
    }
}
