//! Endpoint probing

use tracing::debug;

use super::ca_client::CaClient;
use crate::models::{EndpointStatus, ProbeOutcome};

/// Classifies CA paths by the status a plain GET returns
///
/// No body parsing happens here; 405 is read as "exists but wants POST".
#[derive(Clone)]
pub struct EndpointProbe {
    client: CaClient,
}

impl EndpointProbe {
    pub fn new(client: CaClient) -> Self {
        Self { client }
    }

    pub fn base_url(&self) -> &str {
        self.client.base_url()
    }

    /// Probe one path
    pub async fn probe(&self, path: &str) -> ProbeOutcome {
        let outcome = match self.client.get(path).await {
            Ok(response) => ProbeOutcome::from_status(response.status),
            Err(e) => ProbeOutcome::ConnectionFailed(describe_transport_error(&e)),
        };

        debug!(path, outcome = %outcome, "Probed CA endpoint");
        outcome
    }

    /// Probe paths in order
    pub async fn probe_all(&self, paths: &[String]) -> Vec<EndpointStatus> {
        let mut statuses = Vec::with_capacity(paths.len());
        for path in paths {
            statuses.push(EndpointStatus {
                path: path.clone(),
                outcome: self.probe(path).await,
            });
        }
        statuses
    }
}

/// Short reason for a request that got no HTTP response
pub(crate) fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "timed out".to_string()
    } else if err.is_connect() {
        "connection refused or unreachable".to_string()
    } else {
        err.to_string()
    }
}
