//! Certificate request, key material and certificate models

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;
use zeroize::Zeroizing;

use super::negotiation::PayloadEncoding;
use crate::utils::error::{CertError, CertResult};
use crate::utils::validation::validate_domain;

/// Default certificate lifetime requested from issuers
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

/// Default RSA key size
pub const DEFAULT_KEY_SIZE: u32 = 2048;

/// Certificate type tag sent to the CA
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CertificateType {
    #[default]
    Server,
    Https,
    Nginx,
    Web,
    Fixed,
    Temp,
    Direct,
}

impl CertificateType {
    pub const ALL: [CertificateType; 7] = [
        CertificateType::Server,
        CertificateType::Https,
        CertificateType::Nginx,
        CertificateType::Web,
        CertificateType::Fixed,
        CertificateType::Temp,
        CertificateType::Direct,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateType::Server => "server",
            CertificateType::Https => "https",
            CertificateType::Nginx => "nginx",
            CertificateType::Web => "web",
            CertificateType::Fixed => "fixed",
            CertificateType::Temp => "temp",
            CertificateType::Direct => "direct",
        }
    }
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertificateType {
    type Err = CertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CertificateType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                CertError::InvalidRequest(format!(
                    "Unknown certificate type '{}' (expected server|https|nginx|web|fixed|temp|direct)",
                    s
                ))
            })
    }
}

/// Encoding of the issued certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pem,
    Der,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Pem => "pem",
            OutputFormat::Der => "der",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = CertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pem" => Ok(OutputFormat::Pem),
            "der" => Ok(OutputFormat::Der),
            other => Err(CertError::InvalidRequest(format!(
                "Unknown output format '{}' (expected pem|der)",
                other
            ))),
        }
    }
}

/// One entry of a certificate's subjectAltName extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SubjectAltName {
    Dns(String),
    Ip(IpAddr),
}

impl fmt::Display for SubjectAltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectAltName::Dns(name) => write!(f, "DNS:{}", name),
            SubjectAltName::Ip(ip) => write!(f, "IP:{}", ip),
        }
    }
}

/// A request for a certificate covering one identity
///
/// Built once per invocation and passed by reference through every component.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct CertificateRequest {
    /// Subject domain (CN and first DNS SAN)
    #[validate(length(min = 1, max = 253))]
    pub domain: String,
    /// Optional IP SAN
    #[serde(default)]
    pub ip: Option<IpAddr>,
    /// Optional service tag reported to the CA
    #[serde(default)]
    pub service: Option<String>,
    /// Optional listening port; adds a port-qualified DNS SAN
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub certificate_type: CertificateType,
    #[validate(range(min = 1, max = 3650))]
    pub validity_days: u32,
    pub key_size: u32,
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl CertificateRequest {
    /// Create a request with default type, validity, key size and format
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ip: None,
            service: None,
            port: None,
            certificate_type: CertificateType::default(),
            validity_days: DEFAULT_VALIDITY_DAYS,
            key_size: DEFAULT_KEY_SIZE,
            output_format: OutputFormat::default(),
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_type(mut self, certificate_type: CertificateType) -> Self {
        self.certificate_type = certificate_type;
        self
    }

    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    pub fn with_key_size(mut self, bits: u32) -> Self {
        self.key_size = bits;
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Check field ranges and the domain shape
    ///
    /// Key size support is checked by the key generator, which owns that failure class.
    pub fn check(&self) -> CertResult<()> {
        self.validate()?;

        if !validate_domain(&self.domain) {
            return Err(CertError::InvalidRequest(format!(
                "'{}' is not a valid DNS name",
                self.domain
            )));
        }

        Ok(())
    }

    /// Service tag reported to the CA: explicit service name, else the port
    pub fn service_tag(&self) -> Option<String> {
        self.service
            .clone()
            .or_else(|| self.port.map(|p| p.to_string()))
    }

    /// SAN list for this request
    ///
    /// Order: domain, `domain:port`, IP, then `localhost` and `127.0.0.1` when
    /// `include_loopback` is set. Duplicates are dropped.
    pub fn subject_alt_names(&self, include_loopback: bool) -> Vec<SubjectAltName> {
        let mut names = vec![SubjectAltName::Dns(self.domain.clone())];

        if let Some(port) = self.port {
            names.push(SubjectAltName::Dns(format!("{}:{}", self.domain, port)));
        }
        if let Some(ip) = self.ip {
            names.push(SubjectAltName::Ip(ip));
        }
        if include_loopback {
            names.push(SubjectAltName::Dns("localhost".to_string()));
            names.push(SubjectAltName::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        }

        let mut unique = Vec::with_capacity(names.len());
        for name in names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        unique
    }
}

/// A private key held in memory
///
/// The PEM text is zeroized on drop and never printed by `Debug`.
#[derive(Clone)]
pub struct KeyMaterial {
    private_key_pem: Zeroizing<String>,
    key_size: u32,
}

impl KeyMaterial {
    pub fn new(private_key_pem: Zeroizing<String>, key_size: u32) -> Self {
        Self {
            private_key_pem,
            key_size,
        }
    }

    /// PEM text: PKCS#8 for generated keys, as supplied for external ones
    pub fn private_key_pem(&self) -> &str {
        self.private_key_pem.as_str()
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_size", &self.key_size)
            .field("private_key_pem", &"[redacted]")
            .finish()
    }
}

/// Where an issued certificate came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CertificateSource {
    /// Returned by the CA on a negotiation attempt
    Ca {
        endpoint: String,
        encoding: PayloadEncoding,
    },
    /// Placed on disk by an operator during manual fallback
    Manual { path: PathBuf },
    /// Signed locally with the request's own key
    SelfSigned,
    /// Issued through the local Tailscale daemon
    Tailscale,
}

impl CertificateSource {
    /// Self-signed certificates are tagged as development-only on the proxy
    pub fn is_development(&self) -> bool {
        matches!(self, CertificateSource::SelfSigned)
    }

    pub fn label(&self) -> String {
        match self {
            CertificateSource::Ca { endpoint, encoding } => {
                format!("CA ({} via {})", endpoint, encoding)
            }
            CertificateSource::Manual { path } => format!("manual ({})", path.display()),
            CertificateSource::SelfSigned => "self-signed".to_string(),
            CertificateSource::Tailscale => "tailscale".to_string(),
        }
    }
}

/// A certificate obtained from an issuer, not yet verified
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM-encoded certificate (may include a chain after the leaf)
    pub certificate_pem: String,
    /// Key generated by the issuer, when the issuer did not sign our CSR
    pub issuer_key: Option<KeyMaterial>,
    pub source: CertificateSource,
}

impl IssuedCertificate {
    pub fn new(certificate_pem: impl Into<String>, source: CertificateSource) -> Self {
        Self {
            certificate_pem: certificate_pem.into(),
            issuer_key: None,
            source,
        }
    }

    pub fn with_issuer_key(mut self, key: KeyMaterial) -> Self {
        self.issuer_key = Some(key);
        self
    }
}

/// Details of a verified certificate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    /// Serial number (hex, colon separated)
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// SAN entries rendered as `DNS:name` / `IP:addr`
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
    /// SHA-256 over the DER encoding
    pub fingerprint_sha256: String,
    pub self_signed: bool,
}

impl CertificateInfo {
    /// Whole days until expiry (negative once expired)
    pub fn days_remaining(&self) -> i64 {
        (self.not_after - Utc::now()).num_days()
    }

    pub fn is_expired(&self) -> bool {
        self.not_after <= Utc::now()
    }
}

/// One certificate store's copy of an installed pair
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreReplica {
    /// Store name from configuration
    pub store: String,
    pub certificate_path: PathBuf,
    pub key_path: PathBuf,
    /// DER copy, written when DER output was requested
    pub der_path: Option<PathBuf>,
    /// Whether the reverse proxy reads from this store
    pub proxy: bool,
}

/// A verified pair replicated into every configured store
#[derive(Debug, Clone, Serialize)]
pub struct InstalledCertificate {
    pub domain: String,
    pub replicas: Vec<StoreReplica>,
}

impl InstalledCertificate {
    pub fn certificate_paths(&self) -> Vec<&PathBuf> {
        self.replicas.iter().map(|r| &r.certificate_path).collect()
    }

    pub fn key_paths(&self) -> Vec<&PathBuf> {
        self.replicas.iter().map(|r| &r.key_path).collect()
    }

    /// Replica the reverse proxy site should reference
    pub fn proxy_replica(&self) -> Option<&StoreReplica> {
        self.replicas
            .iter()
            .find(|r| r.proxy)
            .or_else(|| self.replicas.first())
    }
}
