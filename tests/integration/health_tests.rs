//! CA health classification against a signing mock CA

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleet_certs::config::{CaConfig, SubjectConfig};
use fleet_certs::models::{HealthClassification, ProbeOutcome};
use fleet_certs::services::negotiator::CANONICAL_ENDPOINT;
use fleet_certs::services::{CaClient, CaHealthMonitor};

use crate::common::*;

fn monitor(url: &str) -> CaHealthMonitor {
    let ca = CaConfig {
        url: Some(url.to_string()),
        connect_timeout_secs: 2,
        probe_before_submit: false,
        ..CaConfig::default()
    };
    CaHealthMonitor::new(CaClient::new(&ca).unwrap(), &ca, &SubjectConfig::default())
}

#[tokio::test]
async fn test_issuing_ca_is_healthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(CANONICAL_ENDPOINT))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CANONICAL_ENDPOINT))
        .respond_with(SigningResponder::new(TestCa::new()))
        .mount(&server)
        .await;

    let report = monitor(&server.uri()).check().await;

    assert_eq!(report.classification, HealthClassification::Healthy);
    assert_eq!(report.classification.exit_code(), 0);
    assert_eq!(report.root, ProbeOutcome::Reachable200);
    assert_eq!(report.trial_attempts.len(), 1);
    assert!(report
        .endpoints
        .iter()
        .any(|e| e.path == CANONICAL_ENDPOINT && e.outcome == ProbeOutcome::MethodNotAllowed405));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["classification"], "healthy");
}

#[tokio::test]
async fn test_trial_failure_is_not_ready() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let report = monitor(&server.uri()).check().await;

    assert_eq!(report.classification, HealthClassification::NotReady);
    assert_eq!(report.classification.exit_code(), 20);
    assert!(report.trial_attempts.iter().all(|a| a.status == Some(500)));
}
