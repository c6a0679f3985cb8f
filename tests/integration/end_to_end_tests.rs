//! Full single-identity runs: mock CA in, files on disk out

use std::sync::Arc;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

use fleet_certs::config::{AppConfig, IssuanceSource};
use fleet_certs::models::{CertificateRequest, CertificateSource, PayloadEncoding, RosterEntry};
use fleet_certs::services::negotiator::CANONICAL_ENDPOINT;
use fleet_certs::services::{
    CertificatePipeline, CertificateVerifier, OperatorPrompt, PipelineOptions, RenewalTarget,
};
use fleet_certs::utils::error::CertError;

use crate::common::*;

fn pipeline(
    config: &AppConfig,
    source: IssuanceSource,
    prompt: Arc<dyn OperatorPrompt>,
    proxy: Arc<FakeProxy>,
) -> CertificatePipeline {
    let options = PipelineOptions {
        source,
        fallback_to_self_signed: false,
        reload: true,
    };
    CertificatePipeline::new(config, options, prompt)
        .unwrap()
        .with_proxy_controller(proxy)
}

fn site_target(domain: &str, port: u16) -> RenewalTarget {
    RenewalTarget::new(CertificateRequest::new(domain).with_port(port))
        .with_site(RosterEntry::ad_hoc(domain, port))
}

#[tokio::test]
async fn test_canonical_endpoint_first_attempt_installs_everywhere() {
    let ca = TestCa::new();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CANONICAL_ENDPOINT))
        .respond_with(SigningResponder::new(ca))
        .expect(1)
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let config = ca_config(root.path(), &server.uri());
    let proxy = Arc::new(FakeProxy::default());
    let pipeline = pipeline(
        &config,
        IssuanceSource::Ca,
        Arc::new(ScriptedPrompt::absent()),
        proxy.clone(),
    );

    let report = pipeline
        .run(&site_target(domains::CANONICAL, 9443))
        .await
        .unwrap();

    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].encoding, PayloadEncoding::Json);
    assert_eq!(
        report.source,
        CertificateSource::Ca {
            endpoint: CANONICAL_ENDPOINT.to_string(),
            encoding: PayloadEncoding::Json,
        }
    );

    let system_cert = root.path().join("ssl/certs/test.example.com.crt");
    let system_key = root.path().join("ssl/private/test.example.com.key");
    let nginx_cert = root.path().join("nginx/ssl/test.example.com.crt");
    let nginx_key = root.path().join("nginx/ssl/test.example.com.key");
    for installed in [&system_cert, &system_key, &nginx_cert, &nginx_key] {
        assert!(installed.exists(), "{:?} missing", installed);
    }
    CertificateVerifier::new()
        .verify_files(&nginx_cert, &nginx_key)
        .unwrap();

    let site = std::fs::read_to_string(report.site_config.unwrap()).unwrap();
    assert!(site.contains("listen 9443 ssl;"));
    assert!(site.contains(&format!("ssl_certificate {};", nginx_cert.display())));
    assert_eq!(proxy.reload_count(), 1);
}

#[tokio::test]
async fn test_exhausted_ca_shows_csr_and_installs_nothing() {
    let server = MockServer::start().await;
    let root = tempfile::tempdir().unwrap();
    let config = ca_config(root.path(), &server.uri());
    let prompt = Arc::new(ScriptedPrompt::absent());
    let proxy = Arc::new(FakeProxy::default());
    let pipeline = pipeline(&config, IssuanceSource::Ca, prompt.clone(), proxy.clone());

    let err = pipeline
        .run(&site_target("manual.internal", 7443))
        .await
        .unwrap_err();

    assert!(matches!(err, CertError::ManualFallbackIncomplete(_)));
    assert_ne!(err.exit_code(), 0);

    let shown = prompt.last_shown().unwrap();
    assert!(shown.contains("-----BEGIN CERTIFICATE REQUEST-----"));
    assert!(shown.contains("manual.internal.crt"));
    assert!(shown.contains("HTTP 404"));

    assert!(!root.path().join("ssl/certs/manual.internal.crt").exists());
    assert!(!root.path().join("nginx/sites-available/manual.internal").exists());
    assert_eq!(proxy.reload_count(), 0);
}

#[tokio::test]
async fn test_operator_completes_manual_fallback() {
    let server = MockServer::start().await;
    let root = tempfile::tempdir().unwrap();
    let config = ca_config(root.path(), &server.uri());
    let ca = TestCa::new();
    let prompt = Arc::new(ScriptedPrompt::signing_with(ca));
    let pipeline = pipeline(
        &config,
        IssuanceSource::Ca,
        prompt.clone(),
        Arc::new(FakeProxy::default()),
    );

    let report = pipeline
        .run(&RenewalTarget::new(CertificateRequest::new("operator.internal")))
        .await
        .unwrap();

    assert!(matches!(report.source, CertificateSource::Manual { .. }));
    assert!(!report.certificate.self_signed);
    assert!(root.path().join("ssl/certs/operator.internal.crt").exists());
    assert!(report.site_config.is_none());
}

#[tokio::test]
async fn test_self_signed_development_certificate() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let proxy = Arc::new(FakeProxy::default());
    let pipeline = pipeline(
        &config,
        IssuanceSource::SelfSigned,
        Arc::new(ScriptedPrompt::absent()),
        proxy,
    );

    let report = pipeline
        .run(&site_target(domains::DEVELOPMENT, 8443))
        .await
        .unwrap();

    let sans = &report.certificate.subject_alt_names;
    for expected in ["DNS:dev.local", "DNS:localhost", "IP:127.0.0.1"] {
        assert!(sans.iter().any(|s| s == expected), "missing {} in {:?}", expected, sans);
    }
    assert!(report.certificate.self_signed);

    let site = std::fs::read_to_string(report.site_config.unwrap()).unwrap();
    assert!(site.contains("X-Certificate-Source"));
}

#[tokio::test]
async fn test_self_signed_fallback_when_ca_is_down() {
    let root = tempfile::tempdir().unwrap();
    let config = ca_config(root.path(), "http://127.0.0.1:1");
    let options = PipelineOptions {
        source: IssuanceSource::Ca,
        fallback_to_self_signed: true,
        reload: false,
    };
    let pipeline = CertificatePipeline::new(&config, options, Arc::new(ScriptedPrompt::absent()))
        .unwrap()
        .without_proxy();

    let report = pipeline
        .run(&RenewalTarget::new(CertificateRequest::new("lab.internal")))
        .await
        .unwrap();

    assert_eq!(report.source, CertificateSource::SelfSigned);
    assert!(report.attempts.is_empty());
}
