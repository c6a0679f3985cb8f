//! Installation into certificate stores and the reverse proxy

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use fleet_certs::config::SubjectConfig;
use fleet_certs::models::{CertificateRequest, CertificateSource, IssuedCertificate, OutputFormat, RosterEntry};
use fleet_certs::services::installer::{CERTIFICATE_MODE, KEY_MODE};
use fleet_certs::services::{
    CertificateInstaller, CertificatePipeline, KeyMaterialGenerator, PipelineOptions, RenewalTarget,
    SelfSignedIssuer,
};
use fleet_certs::utils::error::CertError;

use crate::common::*;

fn mode(path: &std::path::Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}

fn self_signed(domain: &str) -> IssuedCertificate {
    let generator = KeyMaterialGenerator::new(SubjectConfig::default());
    let key = generator.generate_key(2048).unwrap();
    let issued = SelfSignedIssuer::new(generator)
        .issue(&CertificateRequest::new(domain), &key)
        .unwrap();
    issued.with_issuer_key(key)
}

#[test]
fn test_der_copy_lands_in_every_store() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let issued = self_signed("der.internal");
    let key = issued.issuer_key.clone().unwrap();

    let installed = CertificateInstaller::new(&config.install)
        .install("der.internal", &issued.certificate_pem, &key, OutputFormat::Der)
        .unwrap();

    assert_eq!(installed.replicas.len(), 2);
    for replica in &installed.replicas {
        let der = replica.der_path.as_ref().unwrap();
        assert!(std::fs::metadata(der).unwrap().len() > 0);
        assert_eq!(mode(&replica.certificate_path), CERTIFICATE_MODE);
        assert_eq!(mode(&replica.key_path), KEY_MODE);
        assert_eq!(
            std::fs::read_to_string(&replica.certificate_path).unwrap(),
            issued.certificate_pem
        );
    }
    assert!(installed.proxy_replica().unwrap().proxy);
}

#[tokio::test]
async fn test_install_existing_writes_and_enables_site() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let proxy = Arc::new(FakeProxy::default());
    let pipeline = CertificatePipeline::new(
        &config,
        PipelineOptions::from_config(&config),
        Arc::new(ScriptedPrompt::absent()),
    )
    .unwrap()
    .with_proxy_controller(proxy.clone());

    let mut issued = self_signed(domains::GRAFANA);
    issued.source = CertificateSource::Manual {
        path: root.path().join("grafana.crt"),
    };
    let target = RenewalTarget::new(CertificateRequest::new(domains::GRAFANA).with_port(3443))
        .with_site(RosterEntry::new(domains::GRAFANA, "grafana", 3443));

    let report = pipeline.install_existing(&target, issued).await.unwrap();

    let site = report.site_config.unwrap();
    let rendered = std::fs::read_to_string(&site).unwrap();
    assert!(rendered.contains("server_name grafana.internal;"));
    assert!(rendered.contains("proxy_pass http://127.0.0.1:3444;"));
    assert!(!rendered.contains("X-Certificate-Source"));
    assert!(root.path().join("nginx/sites-enabled/grafana").exists());
    assert!(report.reloaded);
    assert_eq!(proxy.reload_count(), 1);
}

#[tokio::test]
async fn test_rejected_site_is_rolled_back() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let proxy = Arc::new(FakeProxy::rejecting());
    let pipeline = CertificatePipeline::new(
        &config,
        PipelineOptions::from_config(&config),
        Arc::new(ScriptedPrompt::absent()),
    )
    .unwrap()
    .with_proxy_controller(proxy.clone());

    let target = RenewalTarget::new(CertificateRequest::new(domains::OLLAMA))
        .with_site(RosterEntry::new(domains::OLLAMA, "ollama", 8443));

    let err = pipeline
        .install_existing(&target, self_signed(domains::OLLAMA))
        .await
        .unwrap_err();

    assert!(matches!(err, CertError::ReverseProxyConfigInvalid(_)));
    assert_eq!(err.exit_code(), 6);
    assert!(!root.path().join("nginx/sites-available/ollama").exists());
    assert!(!root.path().join("nginx/sites-enabled/ollama").exists());
    assert_eq!(proxy.reload_count(), 0);
}
