//! Error types and handling
//!
//! Every failure the certificate tooling can surface is a [`CertError`]. Errors are
//! classified into process exit codes so cron jobs and wrapper scripts can react to
//! the failure class without parsing output.

use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Certificate lifecycle error types
#[derive(Debug, Error)]
pub enum CertError {
    /// The certificate request itself is unusable (missing or malformed domain, bad flags)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Private key generation failed (e.g. unsupported key size)
    #[error("Key generation failed: {0}")]
    KeyGen(String),

    /// CSR generation failed (malformed DN or SAN configuration)
    #[error("CSR generation failed: {0}")]
    CsrGen(String),

    /// CA or reverse proxy could not be reached at all
    #[error("CA unreachable: {0}")]
    Connectivity(String),

    /// Every endpoint/encoding combination was tried without obtaining a certificate
    #[error("Negotiation exhausted after {attempts} attempts")]
    NegotiationExhausted { attempts: usize },

    /// The operator did not provide a certificate during manual fallback
    #[error("Manual fallback incomplete: {0}")]
    ManualFallbackIncomplete(String),

    /// Certificate is not a well-formed X.509 PEM document
    #[error("Invalid certificate format: {0}")]
    InvalidCertificateFormat(String),

    /// Private key could not be parsed
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Certificate public key does not match the private key
    #[error("Certificate does not match private key: {0}")]
    KeyCertificateMismatch(String),

    /// Generated reverse proxy configuration failed validation and was rolled back
    #[error("Reverse proxy configuration invalid: {0}")]
    ReverseProxyConfigInvalid(String),

    /// Scheduled renewal finished with failed entries
    #[error("Renewal finished with {failed} of {total} entries failed")]
    PartialRosterFailure { failed: usize, total: usize },

    /// A local issuer (self-signed, Tailscale) could not produce a certificate
    #[error("Certificate issuance failed: {0}")]
    Issuance(String),

    /// Copying into a certificate store failed or left an inconsistent store
    #[error("Installation failed: {0}")]
    Install(String),

    /// Another process is currently renewing the same domain
    #[error("Renewal already in progress for {0}")]
    LockHeld(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// External command could not be executed
    #[error("Command failed: {0}")]
    Command(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Process received a termination signal
    #[error("Interrupted")]
    Interrupted,
}

impl CertError {
    /// Map the error onto (exit code, error type identifier, should log as error)
    pub fn classify(&self) -> (u8, &'static str, bool) {
        match self {
            CertError::InvalidRequest(_) => (2, "invalid_request", false),
            CertError::KeyGen(_) => (1, "key_generation", true),
            CertError::CsrGen(_) => (1, "csr_generation", true),
            CertError::Connectivity(_) => (3, "connectivity", true),
            CertError::NegotiationExhausted { .. } => (4, "negotiation_exhausted", true),
            CertError::ManualFallbackIncomplete(_) => (4, "manual_fallback_incomplete", true),
            CertError::InvalidCertificateFormat(_) => (5, "invalid_certificate_format", true),
            CertError::InvalidPrivateKey(_) => (5, "invalid_private_key", true),
            CertError::KeyCertificateMismatch(_) => (5, "key_certificate_mismatch", true),
            CertError::ReverseProxyConfigInvalid(_) => (6, "reverse_proxy_config_invalid", true),
            CertError::LockHeld(_) => (7, "lock_held", false),
            CertError::PartialRosterFailure { .. } => (8, "partial_roster_failure", true),
            CertError::Issuance(_) => (1, "issuance", true),
            CertError::Install(_) => (1, "install", true),
            CertError::Config(_) => (1, "config_error", true),
            CertError::Command(_) => (1, "command_error", true),
            CertError::Io(_) => (1, "io_error", true),
            CertError::Interrupted => (130, "interrupted", false),
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        self.classify().0
    }

    /// Errors that must stop the current domain before anything is installed
    pub fn blocks_installation(&self) -> bool {
        matches!(
            self,
            CertError::InvalidCertificateFormat(_)
                | CertError::InvalidPrivateKey(_)
                | CertError::KeyCertificateMismatch(_)
                | CertError::ManualFallbackIncomplete(_)
        )
    }

    /// Log the error (when its class warrants it) and build a report for output
    pub fn report(&self) -> ErrorReport {
        let (exit_code, error_type, should_log) = self.classify();

        if should_log {
            error!(error = %self, error_type = error_type, "Operation failed");
        }

        ErrorReport::new(error_type, self.to_string()).with_exit_code(exit_code)
    }
}

/// Machine-readable error summary printed by `--json` commands
#[derive(Serialize, Debug, Clone)]
pub struct ErrorReport {
    /// Error type identifier
    pub error: String,
    /// Human-readable error message
    pub message: String,
    /// Process exit code
    pub exit_code: u8,
    /// Remediation hint for the operator (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorReport {
    /// Create a new error report
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            exit_code: 1,
            hint: None,
        }
    }

    /// Set the exit code
    pub fn with_exit_code(mut self, exit_code: u8) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Add a remediation hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

// Implement From for common error types

impl From<reqwest::Error> for CertError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CertError::Connectivity("CA request timed out".to_string())
        } else if err.is_connect() {
            CertError::Connectivity("Failed to connect to CA".to_string())
        } else {
            CertError::Connectivity(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CertError {
    fn from(err: serde_json::Error) -> Self {
        CertError::InvalidRequest(format!("JSON error: {}", err))
    }
}

impl From<validator::ValidationErrors> for CertError {
    fn from(err: validator::ValidationErrors) -> Self {
        CertError::InvalidRequest(err.to_string())
    }
}

/// Result type alias for certificate operations
pub type CertResult<T> = Result<T, CertError>;
