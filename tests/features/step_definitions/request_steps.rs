//! Request step definitions

use cucumber::when;

use fleet_certs::config::IssuanceSource;
use fleet_certs::models::{CertificateRequest, RosterEntry};
use fleet_certs::services::RenewalTarget;

use crate::features::support::CertWorld;

#[when(expr = "I request a certificate for {string}")]
async fn request_certificate(world: &mut CertWorld, domain: String) {
    let target = RenewalTarget::new(CertificateRequest::new(domain));
    world.run(IssuanceSource::Ca, target).await;
}

#[when(expr = "I request a certificate for {string} on port {int}")]
async fn request_certificate_on_port(world: &mut CertWorld, domain: String, port: u16) {
    let target = RenewalTarget::new(CertificateRequest::new(domain.clone()).with_port(port))
        .with_site(RosterEntry::ad_hoc(&domain, port));
    world.run(IssuanceSource::Ca, target).await;
}

#[when(expr = "I issue a self-signed certificate for {string} on port {int}")]
async fn issue_self_signed(world: &mut CertWorld, domain: String, port: u16) {
    let target = RenewalTarget::new(CertificateRequest::new(domain.clone()).with_port(port))
        .with_site(RosterEntry::ad_hoc(&domain, port));
    world.run(IssuanceSource::SelfSigned, target).await;
}
