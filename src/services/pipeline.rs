//! Single-identity renewal path
//!
//! lock → workspace → key + CSR → issue → verify → install → site config → reload.
//! Every scratch file lives in the workspace, which is removed when the run ends
//! on any path, including cancellation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::ca_client::CaClient;
use super::installer::CertificateInstaller;
use super::keygen::{GeneratedMaterial, KeyMaterialGenerator, Workspace};
use super::lock::DomainLock;
use super::manual_fallback::{ManualFallbackPresenter, ManualRequest, OperatorPrompt};
use super::negotiator::{CertificateRequestNegotiator, NegotiationOutcome};
use super::proxy::{NginxController, ProxyController, ProxySiteManager, SiteSpec};
use super::self_signed::SelfSignedIssuer;
use super::tailscale::TailscaleIssuer;
use super::verifier::CertificateVerifier;
use crate::config::{AppConfig, IssuanceSource, ProxyConfig};
use crate::models::{
    AttemptRecord, CertificateInfo, CertificateRequest, CertificateSource, InstalledCertificate,
    IssuedCertificate, KeyMaterial, RosterEntry,
};
use crate::utils::error::{CertError, CertResult};

/// How a pipeline issues and activates certificates
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub source: IssuanceSource,
    /// Self-sign instead of falling back to the operator when the CA gives nothing
    pub fallback_to_self_signed: bool,
    /// Reload the proxy after a site was applied (the scheduler batches this instead)
    pub reload: bool,
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            source: config.renewal.source,
            fallback_to_self_signed: config.renewal.fallback_to_self_signed,
            reload: true,
        }
    }
}

/// One identity to renew, with its proxy site when it has one
#[derive(Debug, Clone)]
pub struct RenewalTarget {
    pub request: CertificateRequest,
    pub site: Option<RosterEntry>,
}

impl RenewalTarget {
    pub fn new(request: CertificateRequest) -> Self {
        Self { request, site: None }
    }

    pub fn with_site(mut self, site: RosterEntry) -> Self {
        self.site = Some(site);
        self
    }

    pub fn domain(&self) -> &str {
        &self.request.domain
    }
}

/// What one successful run did
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub domain: String,
    pub source: CertificateSource,
    pub certificate: CertificateInfo,
    pub installed: InstalledCertificate,
    /// Site file that was activated
    pub site_config: Option<PathBuf>,
    pub attempts: Vec<AttemptRecord>,
    pub reloaded: bool,
}

/// The single-identity renewal path, as seen by the scheduler
#[async_trait]
pub trait IdentityRenewer: Send + Sync {
    async fn renew(&self, target: &RenewalTarget) -> CertResult<PipelineReport>;

    /// Reload the reverse proxy once after a batch of renewals
    async fn reload_proxy(&self) -> CertResult<()>;
}

/// Composes every component into the full single-identity path
pub struct CertificatePipeline {
    generator: KeyMaterialGenerator,
    negotiator: Option<CertificateRequestNegotiator>,
    self_signed: SelfSignedIssuer,
    tailscale: TailscaleIssuer,
    presenter: ManualFallbackPresenter,
    verifier: CertificateVerifier,
    installer: CertificateInstaller,
    proxy: ProxyConfig,
    sites: Option<ProxySiteManager>,
    lock_dir: PathBuf,
    work_dir: Option<PathBuf>,
    options: PipelineOptions,
}

impl CertificatePipeline {
    /// Build the pipeline from configuration
    ///
    /// The CA client is only created when the source is the CA.
    pub fn new(
        config: &AppConfig,
        options: PipelineOptions,
        prompt: Arc<dyn OperatorPrompt>,
    ) -> CertResult<Self> {
        let generator = KeyMaterialGenerator::new(config.subject.clone());

        let negotiator = match options.source {
            IssuanceSource::Ca => {
                let client = CaClient::new(&config.ca)?;
                Some(CertificateRequestNegotiator::new(client, &config.ca))
            }
            IssuanceSource::SelfSigned | IssuanceSource::Tailscale => None,
        };

        let sites = config.proxy.enabled.then(|| {
            let controller: Arc<dyn ProxyController> = Arc::new(NginxController::new(&config.proxy));
            ProxySiteManager::new(&config.proxy, controller)
        });

        Ok(Self {
            self_signed: SelfSignedIssuer::new(generator.clone()),
            generator,
            negotiator,
            tailscale: TailscaleIssuer::new(&config.tailscale),
            presenter: ManualFallbackPresenter::new(
                prompt,
                Duration::from_secs(config.renewal.manual_wait_secs),
            ),
            verifier: CertificateVerifier::new(),
            installer: CertificateInstaller::new(&config.install),
            proxy: config.proxy.clone(),
            sites,
            lock_dir: config.lock_dir.clone(),
            work_dir: config.work_dir.clone(),
            options,
        })
    }

    /// Replace the negotiator (custom catalog or client)
    pub fn with_negotiator(mut self, negotiator: CertificateRequestNegotiator) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Drive a different proxy implementation
    pub fn with_proxy_controller(mut self, controller: Arc<dyn ProxyController>) -> Self {
        self.sites = Some(ProxySiteManager::new(&self.proxy, controller));
        self
    }

    /// Install certificates without touching the reverse proxy
    pub fn without_proxy(mut self) -> Self {
        self.sites = None;
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run the full path for one identity
    pub async fn run(&self, target: &RenewalTarget) -> CertResult<PipelineReport> {
        let request = &target.request;
        request.check()?;

        let _lock = DomainLock::acquire(&self.lock_dir, &request.domain)?;
        let workspace = Workspace::create(self.work_dir.as_deref())?;

        info!(
            "Renewing {} (source: {:?}, workspace: {:?})",
            request.domain,
            self.options.source,
            workspace.path()
        );

        let (issued, local_key, attempts) = match self.options.source {
            IssuanceSource::Tailscale => {
                let issued = self.tailscale.issue(&request.domain, &workspace).await?;
                (issued, None, Vec::new())
            }
            IssuanceSource::SelfSigned => {
                let material = self.generator.generate(request, &workspace, true)?;
                let issued = self.self_signed.issue(request, &material.key)?;
                (issued, Some(material.key), Vec::new())
            }
            IssuanceSource::Ca => {
                let material = self.generator.generate(request, &workspace, false)?;
                let (issued, attempts) = self.issue_from_ca(request, &material, &workspace).await?;
                (issued, Some(material.key), attempts)
            }
        };

        self.activate(target, issued, local_key, attempts).await
    }

    /// Verify, install and activate a pair obtained outside the pipeline
    ///
    /// The certificate must carry its key as `issuer_key`.
    pub async fn install_existing(
        &self,
        target: &RenewalTarget,
        issued: IssuedCertificate,
    ) -> CertResult<PipelineReport> {
        target.request.check()?;
        let _lock = DomainLock::acquire(&self.lock_dir, &target.request.domain)?;
        self.activate(target, issued, None, Vec::new()).await
    }

    async fn activate(
        &self,
        target: &RenewalTarget,
        issued: IssuedCertificate,
        local_key: Option<KeyMaterial>,
        attempts: Vec<AttemptRecord>,
    ) -> CertResult<PipelineReport> {
        let request = &target.request;

        let key = match (&issued.issuer_key, local_key) {
            (Some(issuer_key), _) => {
                info!("Using the key supplied with the certificate");
                issuer_key.clone()
            }
            (None, Some(local)) => local,
            (None, None) => {
                return Err(CertError::Issuance(format!(
                    "{} returned no private key",
                    issued.source.label()
                )))
            }
        };

        let certificate = self
            .verifier
            .verify(&issued.certificate_pem, key.private_key_pem())?;

        let installed = self.installer.install(
            &request.domain,
            &issued.certificate_pem,
            &key,
            request.output_format,
        )?;

        let mut site_config = None;
        let mut reloaded = false;
        if let (Some(sites), Some(entry)) = (&self.sites, &target.site) {
            let replica = installed.proxy_replica().ok_or_else(|| {
                CertError::Install(format!("no store holds {} for the proxy", request.domain))
            })?;
            let spec = SiteSpec::new(entry, replica, &self.proxy, issued.source.is_development());
            site_config = Some(sites.apply_site(&spec).await?);

            if self.options.reload {
                sites.controller().reload().await?;
                reloaded = true;
            }
        }

        info!(
            "Renewed {} from {} (expires {})",
            request.domain,
            issued.source.label(),
            certificate.not_after
        );

        Ok(PipelineReport {
            domain: request.domain.clone(),
            source: issued.source,
            certificate,
            installed,
            site_config,
            attempts,
            reloaded,
        })
    }

    async fn issue_from_ca(
        &self,
        request: &CertificateRequest,
        material: &GeneratedMaterial,
        workspace: &Workspace,
    ) -> CertResult<(IssuedCertificate, Vec<AttemptRecord>)> {
        let negotiator = self
            .negotiator
            .as_ref()
            .ok_or_else(|| CertError::Config("CA client is not configured".to_string()))?;

        match negotiator.negotiate(request, &material.csr_pem).await {
            NegotiationOutcome::Issued {
                certificate,
                attempts,
            } => Ok((certificate, attempts)),
            NegotiationOutcome::Exhausted {
                attempts,
                ca_reachable,
            } => {
                if self.options.fallback_to_self_signed {
                    warn!(
                        "No certificate from {}; issuing a self-signed one for {}",
                        negotiator.base_url(),
                        request.domain
                    );
                    let issued = self.self_signed.issue(request, &material.key)?;
                    return Ok((issued, attempts));
                }

                if !ca_reachable {
                    return Err(CertError::Connectivity(format!(
                        "{} refused the connection",
                        negotiator.base_url()
                    )));
                }

                let exhausted = CertError::NegotiationExhausted {
                    attempts: attempts.len(),
                };
                warn!("{}; switching to manual fallback", exhausted);

                let destination = workspace.cert_path(&request.domain);
                let issued = self
                    .presenter
                    .present(ManualRequest {
                        ca_url: negotiator.base_url(),
                        request,
                        csr_pem: &material.csr_pem,
                        destination: &destination,
                        attempts: &attempts,
                    })
                    .await?;
                Ok((issued, attempts))
            }
        }
    }
}

#[async_trait]
impl IdentityRenewer for CertificatePipeline {
    async fn renew(&self, target: &RenewalTarget) -> CertResult<PipelineReport> {
        self.run(target).await
    }

    async fn reload_proxy(&self) -> CertResult<()> {
        match &self.sites {
            Some(sites) => sites.controller().reload().await,
            None => Ok(()),
        }
    }
}
