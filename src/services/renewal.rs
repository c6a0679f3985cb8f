//! Scheduled renewal of the service roster
//!
//! Every roster entry plus the main identity goes through the single-identity path
//! once. A failed entry is recorded and the run moves on; the reverse proxy is
//! reloaded exactly once at the end.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::pipeline::{IdentityRenewer, PipelineReport, RenewalTarget};
use crate::config::AppConfig;
use crate::models::CertificateRequest;
use crate::utils::error::{CertError, CertResult, ErrorReport};

/// Targets for one scheduled run: the roster in order, then the main identity
pub fn plan(config: &AppConfig) -> Vec<RenewalTarget> {
    let request_for = |domain: &str| {
        CertificateRequest::new(domain)
            .with_type(config.renewal.certificate_type)
            .with_validity_days(config.renewal.validity_days)
            .with_key_size(config.renewal.key_size)
    };

    let mut targets: Vec<RenewalTarget> = config
        .roster
        .iter()
        .map(|entry| {
            RenewalTarget::new(request_for(&entry.domain).with_port(entry.port))
                .with_site(entry.clone())
        })
        .collect();

    if let Some(ref identity) = config.renewal.main_identity {
        if targets.iter().any(|t| t.domain() == identity) {
            warn!("Main identity {} is also on the roster; renewing it once", identity);
        } else {
            targets.push(RenewalTarget::new(request_for(identity)));
        }
    }

    targets
}

/// Outcome for one roster entry
#[derive(Debug, Clone, Serialize)]
pub struct EntryResult {
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<PipelineReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl EntryResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a full scheduled run
#[derive(Debug, Clone, Serialize)]
pub struct RenewalSummary {
    /// Correlates the log lines of one run
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entries: Vec<EntryResult>,
    /// Whether the batched reload ran
    pub reload_attempted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reload_error: Option<String>,
}

impl RenewalSummary {
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| !e.succeeded()).count()
    }

    pub fn succeeded(&self) -> usize {
        self.total() - self.failed()
    }

    /// Failed entries become `PartialRosterFailure`, a failed reload a command error
    pub fn into_result(self) -> CertResult<RenewalSummary> {
        let failed = self.failed();
        if failed > 0 {
            return Err(CertError::PartialRosterFailure {
                failed,
                total: self.total(),
            });
        }
        if let Some(ref reason) = self.reload_error {
            return Err(CertError::Command(format!("proxy reload failed: {}", reason)));
        }
        Ok(self)
    }
}

/// Drives the single-identity path over a roster
pub struct RenewalScheduler {
    renewer: Arc<dyn IdentityRenewer>,
    targets: Vec<RenewalTarget>,
}

impl RenewalScheduler {
    pub fn new(renewer: Arc<dyn IdentityRenewer>, targets: Vec<RenewalTarget>) -> Self {
        Self { renewer, targets }
    }

    pub fn targets(&self) -> &[RenewalTarget] {
        &self.targets
    }

    /// Renew every target once, then reload the proxy once
    pub async fn run(&self) -> RenewalSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "Starting renewal of {} identities", self.targets.len());

        let mut entries = Vec::with_capacity(self.targets.len());
        for (index, target) in self.targets.iter().enumerate() {
            info!(
                "[{}/{}] Renewing {}",
                index + 1,
                self.targets.len(),
                target.domain()
            );

            let entry = match self.renewer.renew(target).await {
                Ok(report) => EntryResult {
                    domain: target.domain().to_string(),
                    report: Some(report),
                    error: None,
                },
                Err(e) => {
                    error!("Renewal of {} failed: {}; continuing", target.domain(), e);
                    EntryResult {
                        domain: target.domain().to_string(),
                        report: None,
                        error: Some(e.report()),
                    }
                }
            };
            entries.push(entry);
        }

        let reload_attempted = !self.targets.is_empty();
        let reload_error = if reload_attempted {
            match self.renewer.reload_proxy().await {
                Ok(()) => None,
                Err(e) => {
                    error!("Batched proxy reload failed: {}", e);
                    Some(e.to_string())
                }
            }
        } else {
            None
        };

        let summary = RenewalSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            entries,
            reload_attempted,
            reload_error,
        };

        info!(
            %run_id,
            "Renewal finished: {} succeeded, {} failed",
            summary.succeeded(),
            summary.failed()
        );
        summary
    }
}

/// Calculate the next run time for a cron expression
pub fn calculate_next_run(cron_expr: &str) -> Option<DateTime<Utc>> {
    let schedule = match Schedule::from_str(cron_expr) {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid cron expression '{}': {}", cron_expr, e);
            return None;
        }
    };

    schedule.upcoming(Utc).next()
}

/// Validate a cron expression
pub fn validate_cron_expression(cron_expr: &str) -> Result<(), String> {
    Schedule::from_str(cron_expr)
        .map(|_| ())
        .map_err(|e| format!("Invalid cron expression: {}", e))
}

/// crontab(5) line running the renewal driver on `cron_expr`
///
/// The seconds field (and a trailing year field) have no crontab equivalent and
/// are dropped.
pub fn crontab_line(cron_expr: &str, binary: &Path, config: Option<&Path>) -> Result<String, String> {
    validate_cron_expression(cron_expr)?;

    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    let minute_to_weekday = match fields.len() {
        6 | 7 => &fields[1..6],
        n => return Err(format!("expected 6 or 7 cron fields, found {}", n)),
    };

    let mut line = format!("{} {}", minute_to_weekday.join(" "), binary.display());
    if let Some(config) = config {
        line.push_str(&format!(" --config {}", config.display()));
    }
    Ok(line)
}
