//! Manual fallback when automated negotiation is exhausted
//!
//! The operator is shown the CSR and the exact path a signed certificate must be
//! written to. Interactive runs wait (bounded) for confirmation or for the file to
//! appear; non-interactive runs check once and fail fast.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use super::verifier::load_certificate_file;
use crate::models::{AttemptOutcome, AttemptRecord, CertificateRequest, CertificateSource, IssuedCertificate};
use crate::utils::error::{CertError, CertResult};

/// How often the destination file is checked while waiting
pub const FILE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How the wait for the operator ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptResult {
    /// Operator pressed Enter
    Confirmed,
    /// The destination file showed up
    FileAppeared,
    /// Nothing happened within the wait bound
    TimedOut,
    /// No operator is attached
    Unavailable,
}

/// Channel to a human operator
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Whether waiting for an answer makes sense
    fn is_interactive(&self) -> bool;

    /// Show instructions to the operator
    fn show(&self, instructions: &str);

    /// Wait up to `timeout` for confirmation or for `destination` to appear
    async fn await_confirmation(&self, destination: &Path, timeout: Duration) -> PromptResult;
}

/// Prompt on the controlling terminal
#[derive(Debug, Default)]
pub struct TerminalPrompt;

#[async_trait]
impl OperatorPrompt for TerminalPrompt {
    fn is_interactive(&self) -> bool {
        use std::io::IsTerminal;
        std::io::stdin().is_terminal()
    }

    fn show(&self, instructions: &str) {
        println!("{}", instructions);
    }

    async fn await_confirmation(&self, destination: &Path, timeout: Duration) -> PromptResult {
        println!(
            "Press Enter once the certificate is in place (waiting up to {}s)...",
            timeout.as_secs()
        );

        let read_line = async {
            let mut line = String::new();
            BufReader::new(tokio::io::stdin()).read_line(&mut line).await
        };

        tokio::select! {
            read = read_line => match read {
                Ok(0) | Err(_) => PromptResult::Unavailable,
                Ok(_) => PromptResult::Confirmed,
            },
            _ = wait_for_file(destination) => PromptResult::FileAppeared,
            _ = tokio::time::sleep(timeout) => PromptResult::TimedOut,
        }
    }
}

/// Prompt for cron and other unattended runs: instructions go to the log only
#[derive(Debug, Default)]
pub struct NonInteractivePrompt;

#[async_trait]
impl OperatorPrompt for NonInteractivePrompt {
    fn is_interactive(&self) -> bool {
        false
    }

    fn show(&self, instructions: &str) {
        for line in instructions.lines() {
            warn!("{}", line);
        }
    }

    async fn await_confirmation(&self, _destination: &Path, _timeout: Duration) -> PromptResult {
        PromptResult::Unavailable
    }
}

/// Poll until the file exists and is non-empty
pub async fn wait_for_file(path: &Path) {
    loop {
        if file_has_content(path) {
            return;
        }
        tokio::time::sleep(FILE_POLL_INTERVAL).await;
    }
}

fn file_has_content(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Where a manual fallback currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackState {
    /// Instructions shown, waiting for the operator to place the file
    AwaitingOperator { destination: PathBuf },
    /// The file is present
    Completed { destination: PathBuf },
    /// The wait ended without a usable file
    Incomplete { reason: String },
}

/// Everything the operator needs to finish a request by hand
pub struct ManualRequest<'a> {
    pub ca_url: &'a str,
    pub request: &'a CertificateRequest,
    pub csr_pem: &'a str,
    pub destination: &'a Path,
    pub attempts: &'a [AttemptRecord],
}

impl fmt::Display for ManualRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "============================================================")?;
        writeln!(f, "Automatic certificate request failed for {}", self.request.domain)?;
        writeln!(f, "============================================================")?;
        writeln!(f, "CA: {}", self.ca_url)?;

        if self.attempts.is_empty() {
            writeln!(f, "No request was submitted (CA unreachable).")?;
        } else {
            writeln!(f, "Attempts:")?;
            for attempt in self.attempts {
                let result = match (&attempt.outcome, attempt.status) {
                    (AttemptOutcome::Transport(reason), _) => reason.clone(),
                    (AttemptOutcome::UnusableCertificate(reason), _) => reason.clone(),
                    (_, Some(status)) => format!("HTTP {}", status),
                    _ => "no response".to_string(),
                };
                writeln!(
                    f,
                    "  {}. {} ({}): {}",
                    attempt.sequence, attempt.endpoint, attempt.encoding, result
                )?;
            }
        }

        writeln!(f)?;
        writeln!(f, "Submit this CSR to the CA manually:")?;
        writeln!(f)?;
        writeln!(f, "{}", self.csr_pem.trim_end())?;
        writeln!(f)?;
        writeln!(f, "Then save the signed certificate (PEM) to:")?;
        writeln!(f, "  {}", self.destination.display())?;
        writeln!(f, "e.g.  cat > {} <<'EOF'", self.destination.display())
    }
}

/// Presents exhausted requests to the operator and collects the result
#[derive(Clone)]
pub struct ManualFallbackPresenter {
    prompt: Arc<dyn OperatorPrompt>,
    max_wait: Duration,
}

impl ManualFallbackPresenter {
    pub fn new(prompt: Arc<dyn OperatorPrompt>, max_wait: Duration) -> Self {
        Self { prompt, max_wait }
    }

    /// Human-readable instructions, including the CSR verbatim
    pub fn instructions(&self, manual: &ManualRequest<'_>) -> String {
        manual.to_string()
    }

    /// Show instructions, wait for the operator, and load the certificate
    pub async fn present(&self, manual: ManualRequest<'_>) -> CertResult<IssuedCertificate> {
        self.prompt.show(&self.instructions(&manual));

        let destination = manual.destination.to_path_buf();
        let mut state = FallbackState::AwaitingOperator {
            destination: destination.clone(),
        };
        info!(state = ?state, "Waiting for manual certificate");

        if self.prompt.is_interactive() && !file_has_content(&destination) {
            let result = self
                .prompt
                .await_confirmation(&destination, self.max_wait)
                .await;
            info!(?result, "Operator wait finished");
        }

        state = if file_has_content(&destination) {
            FallbackState::Completed { destination }
        } else {
            FallbackState::Incomplete {
                reason: format!(
                    "no certificate found at {} for {}",
                    manual.destination.display(),
                    manual.request.domain
                ),
            }
        };

        match state {
            FallbackState::Completed { destination } => {
                let certificate_pem = load_certificate_file(&destination)?;
                info!("Manual certificate found at {:?}", destination);
                Ok(IssuedCertificate::new(
                    certificate_pem,
                    CertificateSource::Manual { path: destination },
                ))
            }
            FallbackState::Incomplete { reason } => Err(CertError::ManualFallbackIncomplete(reason)),
            FallbackState::AwaitingOperator { .. } => Err(CertError::ManualFallbackIncomplete(
                "operator wait did not finish".to_string(),
            )),
        }
    }
}
