//! Test fixtures for common test data
//!
//! Fixtures provide a throwaway CA and configurations whose stores, locks and
//! proxy directories all live under one temp directory.

use std::path::Path;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams, DnType,
    IsCa, KeyPair, KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};

use fleet_certs::config::{AppConfig, CertificateStore, InstallConfig};
use fleet_certs::models::RosterEntry;

/// Domains used across scenarios
pub mod domains {
    pub const CANONICAL: &str = "test.example.com";
    pub const DEVELOPMENT: &str = "dev.local";
    pub const GRAFANA: &str = "grafana.internal";
    pub const OLLAMA: &str = "ollama.internal";
    pub const MAIN_IDENTITY: &str = "*.internal";
}

/// A certificate authority that exists only for the test run
pub struct TestCa {
    pub certificate: Certificate,
    pub key: KeyPair,
}

impl TestCa {
    pub fn new() -> Arc<Self> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "Fleet Test CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let certificate = params.self_signed(&key).unwrap();

        Arc::new(Self { certificate, key })
    }

    pub fn pem(&self) -> String {
        self.certificate.pem()
    }

    /// Sign a CSR the way the CA's legacy endpoints do
    pub fn sign_csr(&self, csr_pem: &str) -> Result<String, rcgen::Error> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)?;
        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now - Duration::days(1);
        csr.params.not_after = now + Duration::days(90);
        Ok(csr.signed_by(&self.certificate, &self.key)?.pem())
    }

    /// Generate a key and certificate for `domain`, as the canonical endpoint does
    pub fn issue_with_key(&self, domain: &str) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, domain);
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(90);
        let certificate = params
            .signed_by(&key, &self.certificate, &self.key)
            .unwrap();
        (certificate.pem(), key.serialize_pem())
    }
}

/// Configuration rooted at `root`: two stores, proxy dirs, locks and workspaces
pub fn test_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.install = InstallConfig {
        stores: vec![
            CertificateStore {
                name: "system".to_string(),
                cert_dir: root.join("ssl/certs"),
                key_dir: root.join("ssl/private"),
                proxy: false,
            },
            CertificateStore {
                name: "nginx".to_string(),
                cert_dir: root.join("nginx/ssl"),
                key_dir: root.join("nginx/ssl"),
                proxy: true,
            },
        ],
        enforce_ownership: false,
        ..InstallConfig::default()
    };
    config.proxy.sites_available = root.join("nginx/sites-available");
    config.proxy.sites_enabled = root.join("nginx/sites-enabled");
    config.lock_dir = root.join("locks");
    config.work_dir = Some(root.join("work"));
    config.renewal.manual_wait_secs = 5;
    config
}

/// Same as [`test_config`], pointed at a mock CA
pub fn ca_config(root: &Path, ca_url: &str) -> AppConfig {
    let mut config = test_config(root);
    config.ca.url = Some(ca_url.to_string());
    config.ca.connect_timeout_secs = 2;
    config.ca.timeout_secs = 10;
    config
}

pub fn roster() -> Vec<RosterEntry> {
    vec![
        RosterEntry::new(domains::GRAFANA, "grafana", 3443),
        RosterEntry::new(domains::OLLAMA, "ollama", 8443).with_upstream_port(11434),
    ]
}
