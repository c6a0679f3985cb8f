//! Negotiation against a mock CA

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleet_certs::config::{CaConfig, SubjectConfig};
use fleet_certs::models::{
    AttemptOutcome, CertificateRequest, CertificateSource, EndpointCandidate, KeyMaterial,
    PayloadEncoding,
};
use fleet_certs::services::negotiator::CANONICAL_ENDPOINT;
use fleet_certs::services::{
    CaClient, CertificateRequestNegotiator, CertificateVerifier, KeyMaterialGenerator,
    NegotiationOutcome,
};

use crate::common::*;

fn negotiator(url: &str) -> CertificateRequestNegotiator {
    let ca = CaConfig {
        url: Some(url.to_string()),
        connect_timeout_secs: 2,
        timeout_secs: 10,
        probe_before_submit: false,
        ..CaConfig::default()
    };
    CertificateRequestNegotiator::new(CaClient::new(&ca).unwrap(), &ca)
}

fn key_and_csr(request: &CertificateRequest) -> (KeyMaterial, String) {
    let generator = KeyMaterialGenerator::new(SubjectConfig::default());
    let key = generator.generate_key(2048).unwrap();
    let csr = generator.generate_csr(request, &key, false).unwrap();
    (key, csr)
}

fn json_only(path: &str) -> EndpointCandidate {
    EndpointCandidate::legacy(path).with_encodings(vec![PayloadEncoding::Json])
}

#[tokio::test]
async fn test_third_endpoint_issues_after_two_failures() {
    let ca = TestCa::new();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/a"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "backend down"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/c"))
        .respond_with(SigningResponder::new(ca.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let request = CertificateRequest::new("app.internal");
    let (key, csr) = key_and_csr(&request);
    let outcome = negotiator(&server.uri())
        .with_catalog(vec![json_only("/api/a"), json_only("/api/b"), json_only("/api/c")])
        .negotiate(&request, &csr)
        .await;

    let NegotiationOutcome::Issued {
        certificate,
        attempts,
    } = outcome
    else {
        panic!("expected a certificate");
    };

    assert_eq!(attempts.len(), 3);
    let statuses: Vec<Option<u16>> = attempts.iter().map(|a| a.status).collect();
    assert_eq!(statuses, vec![Some(500), Some(404), Some(200)]);
    assert_eq!(attempts[0].ca_message.as_deref(), Some("backend down"));
    assert_eq!(attempts[2].outcome, AttemptOutcome::Issued);
    assert_eq!(
        certificate.source,
        CertificateSource::Ca {
            endpoint: "/api/c".to_string(),
            encoding: PayloadEncoding::Json,
        }
    );

    // The CA signed our CSR, so the local key must match
    assert!(certificate.issuer_key.is_none());
    CertificateVerifier::new()
        .verify(&certificate.certificate_pem, key.private_key_pem())
        .unwrap();
}

#[tokio::test]
async fn test_encodings_fall_back_in_order() {
    let ca = TestCa::new();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CANONICAL_ENDPOINT))
        .respond_with(FailFirst::new(2, SigningResponder::new(ca)))
        .mount(&server)
        .await;

    let request = CertificateRequest::new(domains::CANONICAL);
    let (_key, csr) = key_and_csr(&request);
    let outcome = negotiator(&server.uri())
        .with_catalog(vec![EndpointCandidate::canonical(CANONICAL_ENDPOINT)])
        .negotiate(&request, &csr)
        .await;

    let encodings: Vec<PayloadEncoding> = outcome.attempts().iter().map(|a| a.encoding).collect();
    assert_eq!(
        encodings,
        vec![
            PayloadEncoding::Json,
            PayloadEncoding::Multipart,
            PayloadEncoding::FormUrlEncoded
        ]
    );

    match outcome {
        NegotiationOutcome::Issued { certificate, .. } => {
            let key = certificate.issuer_key.expect("canonical endpoint returns its key");
            CertificateVerifier::new()
                .verify(&certificate.certificate_pem, key.private_key_pem())
                .unwrap();
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_certificate_under_data_is_extracted() {
    let ca = TestCa::new();
    let request = CertificateRequest::new("nested.internal");
    let (key, csr) = key_and_csr(&request);
    let signed = ca.sign_csr(&csr).unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/sign"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true, "data": {"certificate": signed}})),
        )
        .mount(&server)
        .await;

    let outcome = negotiator(&server.uri())
        .with_catalog(vec![json_only("/api/sign")])
        .negotiate(&request, &csr)
        .await;

    let NegotiationOutcome::Issued { certificate, .. } = outcome else {
        panic!("expected a certificate");
    };
    CertificateVerifier::new()
        .verify(&certificate.certificate_pem, key.private_key_pem())
        .unwrap();
}

#[tokio::test]
async fn test_every_combination_tried_before_exhaustion() {
    let server = MockServer::start().await;
    let request = CertificateRequest::new("nobody.internal");
    let (_key, csr) = key_and_csr(&request);

    let negotiator = negotiator(&server.uri());
    let expected: usize = negotiator.catalog().iter().map(|c| c.encodings.len()).sum();

    match negotiator.negotiate(&request, &csr).await {
        NegotiationOutcome::Exhausted {
            attempts,
            ca_reachable,
        } => {
            assert!(ca_reachable);
            assert_eq!(attempts.len(), expected);
            assert!(attempts.iter().all(|a| a.status == Some(404)));
            let sequences: Vec<usize> = attempts.iter().map(|a| a.sequence).collect();
            assert_eq!(sequences, (1..=expected).collect::<Vec<_>>());
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_ca_submits_nothing() {
    let request = CertificateRequest::new("offline.internal");
    let (_key, csr) = key_and_csr(&request);

    match negotiator("http://127.0.0.1:1").negotiate(&request, &csr).await {
        NegotiationOutcome::Exhausted {
            attempts,
            ca_reachable,
        } => {
            assert!(!ca_reachable);
            assert!(attempts.is_empty());
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_canonical_certificate_for_submitted_csr_is_accepted() {
    let ca = TestCa::new();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CANONICAL_ENDPOINT))
        .respond_with(SigningResponder::signing_only(ca))
        .expect(1)
        .mount(&server)
        .await;

    let request = CertificateRequest::new(domains::CANONICAL);
    let (key, csr) = key_and_csr(&request);
    let outcome = negotiator(&server.uri())
        .with_catalog(vec![EndpointCandidate::canonical(CANONICAL_ENDPOINT)])
        .negotiate(&request, &csr)
        .await;

    let NegotiationOutcome::Issued {
        certificate,
        attempts,
    } = outcome
    else {
        panic!("expected a certificate");
    };
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].encoding, PayloadEncoding::Json);
    assert!(certificate.issuer_key.is_none());
    CertificateVerifier::new()
        .verify(&certificate.certificate_pem, key.private_key_pem())
        .unwrap();
}

#[tokio::test]
async fn test_certificate_for_another_key_moves_on() {
    let ca = TestCa::new();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CANONICAL_ENDPOINT))
        .respond_with(foreign_key_certificate(&ca, domains::CANONICAL))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/sign"))
        .respond_with(SigningResponder::new(ca.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let request = CertificateRequest::new(domains::CANONICAL);
    let (key, csr) = key_and_csr(&request);
    let outcome = negotiator(&server.uri())
        .with_catalog(vec![
            EndpointCandidate::canonical(CANONICAL_ENDPOINT),
            json_only("/api/sign"),
        ])
        .negotiate(&request, &csr)
        .await;

    let NegotiationOutcome::Issued {
        certificate,
        attempts,
    } = outcome
    else {
        panic!("expected a certificate");
    };

    assert_eq!(attempts.len(), 4);
    for attempt in &attempts[..3] {
        assert_eq!(attempt.status, Some(200));
        assert!(matches!(attempt.outcome, AttemptOutcome::UnusableCertificate(_)));
    }
    assert_eq!(attempts[3].endpoint, "/api/sign");
    assert_eq!(attempts[3].outcome, AttemptOutcome::Issued);
    CertificateVerifier::new()
        .verify(&certificate.certificate_pem, key.private_key_pem())
        .unwrap();
}

#[tokio::test]
async fn test_slow_root_does_not_stop_negotiation() {
    let ca = TestCa::new();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/sign"))
        .respond_with(SigningResponder::new(ca))
        .expect(1)
        .mount(&server)
        .await;

    let config = CaConfig {
        url: Some(server.uri()),
        connect_timeout_secs: 1,
        timeout_secs: 1,
        probe_before_submit: false,
        ..CaConfig::default()
    };
    let request = CertificateRequest::new("slow.internal");
    let (_key, csr) = key_and_csr(&request);
    let outcome = CertificateRequestNegotiator::new(CaClient::new(&config).unwrap(), &config)
        .with_catalog(vec![json_only("/api/sign")])
        .negotiate(&request, &csr)
        .await;

    match outcome {
        NegotiationOutcome::Issued { attempts, .. } => assert_eq!(attempts.len(), 1),
        other => panic!("unexpected outcome: {:?}", other),
    }
}
