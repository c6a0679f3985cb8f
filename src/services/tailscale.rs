//! Certificates issued through the local Tailscale daemon

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use super::command::run_command;
use super::keygen::{key_material_from_pem, Workspace};
use super::verifier::load_certificate_file;
use crate::config::TailscaleConfig;
use crate::models::{CertificateSource, IssuedCertificate};
use crate::utils::error::{CertError, CertResult};

/// Runs `tailscale cert` into the scoped workspace
///
/// Tailscale generates its own key, which travels with the certificate.
#[derive(Debug, Clone)]
pub struct TailscaleIssuer {
    binary: PathBuf,
    timeout: Duration,
}

impl TailscaleIssuer {
    pub fn new(config: &TailscaleConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Arguments passed to the tailscale CLI
    pub fn arguments(&self, domain: &str, workspace: &Workspace) -> Vec<String> {
        vec![
            "cert".to_string(),
            "--cert-file".to_string(),
            workspace.cert_path(domain).display().to_string(),
            "--key-file".to_string(),
            workspace.key_path(domain).display().to_string(),
            domain.to_string(),
        ]
    }

    pub async fn issue(&self, domain: &str, workspace: &Workspace) -> CertResult<IssuedCertificate> {
        info!("Requesting certificate for {} from Tailscale", domain);

        let report = run_command(&self.binary, &self.arguments(domain, workspace), self.timeout).await?;
        if !report.success {
            return Err(CertError::Issuance(format!(
                "tailscale cert failed for {}: {}",
                domain,
                report.diagnostics()
            )));
        }

        let certificate_pem = load_certificate_file(&workspace.cert_path(domain))?;
        let key_path = workspace.key_path(domain);
        let key_pem = std::fs::read_to_string(&key_path).map_err(|e| {
            CertError::InvalidPrivateKey(format!("cannot read {:?}: {}", key_path, e))
        })?;
        let key = key_material_from_pem(&key_pem)?;

        Ok(IssuedCertificate::new(certificate_pem, CertificateSource::Tailscale).with_issuer_key(key))
    }
}
