//! Outcome step definitions

use cucumber::then;

use fleet_certs::models::CertificateSource;

use crate::features::support::CertWorld;

#[then("the certificate is installed in every store")]
async fn installed_everywhere(world: &mut CertWorld) {
    let report = world
        .report
        .as_ref()
        .unwrap_or_else(|| panic!("run failed: {:?}", world.error));
    assert_eq!(report.installed.replicas.len(), 2);
    for replica in &report.installed.replicas {
        assert!(replica.certificate_path.exists());
        assert!(replica.key_path.exists());
    }
}

#[then(expr = "the proxy site listens on port {int}")]
async fn site_listens(world: &mut CertWorld, port: u16) {
    let report = world.report.as_ref().unwrap();
    let site = std::fs::read_to_string(report.site_config.as_ref().unwrap()).unwrap();
    assert!(site.contains(&format!("listen {} ssl;", port)));
}

#[then("the proxy site is marked as development only")]
async fn site_marked_development(world: &mut CertWorld) {
    let report = world.report.as_ref().unwrap();
    let site = std::fs::read_to_string(report.site_config.as_ref().unwrap()).unwrap();
    assert!(site.contains("X-Certificate-Source"));
}

#[then(expr = "{int} attempt(s) was/were made")]
async fn attempts_made(world: &mut CertWorld, count: usize) {
    assert_eq!(world.report.as_ref().unwrap().attempts.len(), count);
}

#[then(expr = "the certificate was issued by {string}")]
async fn issued_by(world: &mut CertWorld, endpoint: String) {
    match world.report.as_ref().unwrap().source {
        CertificateSource::Ca { endpoint: ref actual, .. } => assert_eq!(actual, &endpoint),
        ref other => panic!("unexpected source: {:?}", other),
    }
}

#[then(expr = "the certificate covers {string}")]
async fn certificate_covers(world: &mut CertWorld, san: String) {
    let sans = &world.report.as_ref().unwrap().certificate.subject_alt_names;
    assert!(sans.contains(&san), "{} not in {:?}", san, sans);
}

#[then(expr = "the request fails with exit code {int}")]
async fn fails_with(world: &mut CertWorld, code: u8) {
    let error = world.error.as_ref().expect("the request should have failed");
    assert_eq!(error.exit_code(), code);
}

#[then("the operator was shown the CSR")]
async fn operator_shown_csr(world: &mut CertWorld) {
    let shown = world.prompt.as_ref().unwrap().last_shown().unwrap();
    assert!(shown.contains("-----BEGIN CERTIFICATE REQUEST-----"));
}

#[then(expr = "nothing is installed for {string}")]
async fn nothing_installed(world: &mut CertWorld, domain: String) {
    let root = world.root_path();
    assert!(!root.join(format!("ssl/certs/{}.crt", domain)).exists());
    assert!(!root.join(format!("nginx/ssl/{}.crt", domain)).exists());
    assert_eq!(world.proxy.reload_count(), 0);
}
