//! Cron driver for scheduled certificate renewal
//!
//! Renews every roster entry and the main identity once, then reloads the reverse
//! proxy once. Never waits for an operator.
//!
//! Usage:
//!   renew-certificates [--config <path>] [--dry-run] [--show-schedule]
//!
//! Options:
//!   --config         Path to configuration file
//!   --dry-run        Show what would be renewed without issuing anything
//!   --show-schedule  Print the next run and a matching crontab line
//!   --json           Print the run summary as JSON
//!   --verbose        Enable verbose output
//!
//! Example cron entry (Sundays at 03:00):
//!   0 3 * * SUN /usr/local/bin/renew-certificates --config /etc/fleet-certs/config.yaml

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use fleet_certs::commands;
use fleet_certs::logging::init_logging;
use fleet_certs::services::manual_fallback::NonInteractivePrompt;
use fleet_certs::services::renewal::{calculate_next_run, crontab_line};
use fleet_certs::utils::error::CertError;
use fleet_certs::AppConfig;

fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut dry_run = false;
    let mut show_schedule = false;
    let mut json = false;
    let mut verbose = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("--config requires a path");
                    return ExitCode::from(2);
                }
            }
            "--dry-run" => {
                dry_run = true;
            }
            "--show-schedule" => {
                show_schedule = true;
            }
            "--json" => {
                json = true;
            }
            "--verbose" | "-v" => {
                verbose = true;
            }
            "--help" | "-h" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                return ExitCode::from(2);
            }
        }
        i += 1;
    }

    let config = match AppConfig::load_from(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    let _log_guard = match init_logging(&config.logging, "renew-certificates", verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    info!("fleet-certs - scheduled renewal");

    if show_schedule {
        return show_schedule_info(&config, config_path.as_deref());
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start the async runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    let result = runtime.block_on(async {
        tokio::select! {
            result = commands::renew(&config, Arc::new(NonInteractivePrompt), dry_run, json) => result,
            _ = tokio::signal::ctrl_c() => Err(CertError::Interrupted),
        }
    });
    runtime.shutdown_timeout(Duration::from_millis(250));

    // Exit with the failure class so cron mail says what went wrong
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            let report = e.report();
            eprintln!("Error: {}", report.message);
            ExitCode::from(report.exit_code)
        }
    }
}

fn show_schedule_info(config: &AppConfig, config_path: Option<&Path>) -> ExitCode {
    let schedule = &config.renewal.schedule;
    println!("Schedule: {}", schedule);

    match calculate_next_run(schedule) {
        Some(next) => println!("Next run: {}", next),
        None => {
            eprintln!("Invalid schedule: {}", schedule);
            return ExitCode::from(1);
        }
    }

    let binary = env::current_exe().unwrap_or_else(|_| PathBuf::from("renew-certificates"));
    match crontab_line(schedule, &binary, config_path) {
        Ok(line) => {
            println!();
            println!("crontab entry:");
            println!("  {}", line);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(1)
        }
    }
}

fn print_help() {
    println!("fleet-certs - Scheduled certificate renewal");
    println!();
    println!("Usage:");
    println!("  renew-certificates [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config <path>   Path to configuration file");
    println!("  --dry-run             Show what would be renewed without issuing anything");
    println!("  --show-schedule       Print the next scheduled run and a crontab line");
    println!("  --json                Print the run summary as JSON");
    println!("  -v, --verbose         Enable verbose output");
    println!("  -h, --help            Show this help message");
    println!();
    println!("Exit codes:");
    println!("  0  every identity renewed");
    println!("  1  configuration or reload failure");
    println!("  8  one or more roster entries failed");
    println!();
    println!("Example cron entries:");
    println!("  # Sundays at 03:00");
    println!("  0 3 * * SUN /usr/local/bin/renew-certificates --config /etc/fleet-certs/config.yaml");
    println!();
    println!("  # Daily at 02:30");
    println!("  30 2 * * * /usr/local/bin/renew-certificates --config /etc/fleet-certs/config.yaml");
}
