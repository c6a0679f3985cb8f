//! fleet-certs library
//!
//! Certificate request, issuance, verification and installation for an internal
//! service fleet, shared by the `fleet-certs` CLI and the `renew-certificates`
//! cron driver.

pub mod cli;
pub mod commands;
pub mod config;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

pub use config::AppConfig;
pub use utils::error::{CertError, CertResult};
