//! Certificate lifecycle services

pub mod ca_client;
pub mod command;
pub mod health;
pub mod installer;
pub mod keygen;
pub mod lock;
pub mod manual_fallback;
pub mod negotiator;
pub mod pipeline;
pub mod probe;
pub mod proxy;
pub mod renewal;
pub mod self_signed;
pub mod tailscale;
pub mod verifier;

pub use ca_client::{CaClient, CaResponse};
pub use command::{run_command, CommandReport};
pub use health::CaHealthMonitor;
pub use installer::CertificateInstaller;
pub use keygen::{GeneratedMaterial, KeyMaterialGenerator, Workspace};
pub use lock::DomainLock;
pub use manual_fallback::{
    FallbackState, ManualFallbackPresenter, ManualRequest, NonInteractivePrompt, OperatorPrompt,
    PromptResult, TerminalPrompt,
};
pub use negotiator::{CertificateRequestNegotiator, ExtractionStrategy, NegotiationOutcome};
pub use pipeline::{
    CertificatePipeline, IdentityRenewer, PipelineOptions, PipelineReport, RenewalTarget,
};
pub use probe::EndpointProbe;
pub use proxy::{NginxController, ProxyController, ProxySiteManager, SiteSpec};
pub use renewal::{RenewalScheduler, RenewalSummary};
pub use self_signed::SelfSignedIssuer;
pub use tailscale::TailscaleIssuer;
pub use verifier::CertificateVerifier;
