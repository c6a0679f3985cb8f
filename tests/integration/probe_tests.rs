//! Endpoint probing against a mock CA

use rstest::rstest;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleet_certs::config::CaConfig;
use fleet_certs::models::ProbeOutcome;
use fleet_certs::services::{CaClient, EndpointProbe};

async fn ca_server() -> MockServer {
    let server = MockServer::start().await;
    for (route, status) in [
        ("/", 200),
        ("/api/generate-cert", 405),
        ("/api/broken", 503),
        ("/api/teapot", 418),
    ] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
    }
    server
}

fn probe(url: &str) -> EndpointProbe {
    let ca = CaConfig {
        url: Some(url.to_string()),
        connect_timeout_secs: 2,
        ..CaConfig::default()
    };
    EndpointProbe::new(CaClient::new(&ca).unwrap())
}

#[rstest]
#[case("/", ProbeOutcome::Reachable200)]
#[case("/api/generate-cert", ProbeOutcome::MethodNotAllowed405)]
#[case("/api/missing", ProbeOutcome::NotFound404)]
#[case("/api/broken", ProbeOutcome::ServerError5xx(503))]
#[case("/api/teapot", ProbeOutcome::Unexpected(418))]
#[tokio::test]
async fn test_probe_classification(#[case] route: &str, #[case] expected: ProbeOutcome) {
    let server = ca_server().await;
    assert_eq!(probe(&server.uri()).probe(route).await, expected);
}

#[tokio::test]
async fn test_probe_all_keeps_order() {
    let server = ca_server().await;
    let paths = vec!["/api/missing".to_string(), "/".to_string()];

    let statuses = probe(&server.uri()).probe_all(&paths).await;

    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].path, "/api/missing");
    assert_eq!(statuses[0].outcome, ProbeOutcome::NotFound404);
    assert!(statuses[1].outcome.endpoint_exists());
}

#[tokio::test]
async fn test_refused_connection_is_connection_failed() {
    let outcome = probe("http://127.0.0.1:1").probe("/").await;
    assert!(matches!(outcome, ProbeOutcome::ConnectionFailed(_)));
    assert!(!outcome.is_connected());
}
