//! Service roster models

use serde::{Deserialize, Serialize};

use crate::utils::validation::file_stem_for_domain;

/// A service whose certificate is renewed on schedule and fronted by the reverse proxy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    /// Certificate subject and `server_name`
    pub domain: String,
    /// Reverse proxy site name (file name under sites-available)
    pub site: String,
    /// TLS port the proxy listens on
    pub port: u16,
    /// Local port the proxy forwards to (defaults to the adjacent port)
    #[serde(default)]
    pub upstream_port: Option<u16>,
}

impl RosterEntry {
    pub fn new(domain: impl Into<String>, site: impl Into<String>, port: u16) -> Self {
        Self {
            domain: domain.into(),
            site: site.into(),
            port,
            upstream_port: None,
        }
    }

    /// Entry for a one-off request that named a port but is not on the roster
    pub fn ad_hoc(domain: &str, port: u16) -> Self {
        Self::new(domain, file_stem_for_domain(domain), port)
    }

    pub fn with_upstream_port(mut self, port: u16) -> Self {
        self.upstream_port = Some(port);
        self
    }

    pub fn upstream_port(&self) -> u16 {
        self.upstream_port
            .unwrap_or_else(|| self.port.saturating_add(1))
    }
}
