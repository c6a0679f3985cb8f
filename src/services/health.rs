//! CA health diagnostics
//!
//! Advisory only: the classification informs operators and never gates renewal.

use chrono::Utc;
use tracing::{info, warn};

use super::ca_client::CaClient;
use super::keygen::KeyMaterialGenerator;
use super::negotiator::{CertificateRequestNegotiator, NegotiationOutcome};
use super::probe::EndpointProbe;
use crate::config::{CaConfig, SubjectConfig};
use crate::models::{
    AttemptRecord, CertificateRequest, EndpointStatus, HealthClassification, HealthReport,
    ProbeOutcome,
};

/// Probes the CA's known paths and tries one throwaway issuance
pub struct CaHealthMonitor {
    probe: EndpointProbe,
    negotiator: CertificateRequestNegotiator,
    generator: KeyMaterialGenerator,
    paths: Vec<String>,
    trial_domain: String,
}

impl CaHealthMonitor {
    pub fn new(client: CaClient, ca: &CaConfig, subject: &SubjectConfig) -> Self {
        Self {
            probe: EndpointProbe::new(client.clone()),
            negotiator: CertificateRequestNegotiator::new(client, ca),
            generator: KeyMaterialGenerator::new(subject.clone()),
            paths: ca.health_paths.clone(),
            trial_domain: ca.trial_domain.clone(),
        }
    }

    pub fn with_negotiator(mut self, negotiator: CertificateRequestNegotiator) -> Self {
        self.negotiator = negotiator;
        self
    }

    pub async fn check(&self) -> HealthReport {
        let base_url = self.probe.base_url().to_string();
        info!("Checking CA health at {}", base_url);

        let root = self.probe.probe("/").await;

        let (endpoints, trial_attempts, classification) = match &root {
            ProbeOutcome::ConnectionFailed(_) => {
                let endpoints = self
                    .paths
                    .iter()
                    .map(|path| EndpointStatus {
                        path: path.clone(),
                        outcome: root.clone(),
                    })
                    .collect();
                (endpoints, Vec::new(), HealthClassification::Down)
            }
            ProbeOutcome::Reachable200 => {
                let endpoints = self.probe.probe_all(&self.paths).await;
                let (issued, attempts) = self.trial_issuance().await;
                let classification = if issued {
                    HealthClassification::Healthy
                } else {
                    HealthClassification::NotReady
                };
                (endpoints, attempts, classification)
            }
            _ => {
                let endpoints = self.probe.probe_all(&self.paths).await;
                (endpoints, Vec::new(), HealthClassification::Issues)
            }
        };

        match classification {
            HealthClassification::Healthy => info!("CA is healthy"),
            other => warn!("CA health: {} (root: {})", other, root),
        }

        HealthReport {
            base_url,
            classification,
            root,
            endpoints,
            trial_attempts,
            checked_at: Utc::now(),
        }
    }

    /// Negotiate a certificate for the trial subject; nothing is written to disk
    async fn trial_issuance(&self) -> (bool, Vec<AttemptRecord>) {
        let request = CertificateRequest::new(self.trial_domain.clone());
        let csr = self
            .generator
            .generate_key(request.key_size)
            .and_then(|key| self.generator.generate_csr(&request, &key, false));

        let csr_pem = match csr {
            Ok(pem) => pem,
            Err(e) => {
                warn!("Could not build trial CSR: {}", e);
                return (false, Vec::new());
            }
        };

        match self.negotiator.negotiate(&request, &csr_pem).await {
            NegotiationOutcome::Issued { attempts, .. } => (true, attempts),
            NegotiationOutcome::Exhausted { attempts, .. } => (false, attempts),
        }
    }
}
