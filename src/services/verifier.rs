//! Certificate well-formedness and key-match verification

use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, Utc};
use rcgen::KeyPair;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use rustls_pki_types::PrivateKeyDer;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};
use x509_parser::public_key::PublicKey;

use crate::models::CertificateInfo;
use crate::utils::error::{CertError, CertResult};

/// Days before expiry at which verification starts warning
pub const DEFAULT_EXPIRY_WARNING_DAYS: i64 = 30;

/// Checks that a certificate parses and that its public key matches a private key
#[derive(Debug, Clone)]
pub struct CertificateVerifier {
    expiry_warning_days: i64,
}

impl Default for CertificateVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateVerifier {
    pub fn new() -> Self {
        Self {
            expiry_warning_days: DEFAULT_EXPIRY_WARNING_DAYS,
        }
    }

    pub fn with_expiry_warning_days(mut self, days: i64) -> Self {
        self.expiry_warning_days = days;
        self
    }

    /// Parse a certificate and report its details
    pub fn inspect(&self, certificate_pem: &str) -> CertResult<CertificateInfo> {
        let der = certificate_der(certificate_pem)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| CertError::InvalidCertificateFormat(e.to_string()))?;
        certificate_info(&cert, &der)
    }

    /// Verify a certificate against the private key it must pair with
    ///
    /// Checks run in order: well-formedness, then public key equality (the modulus
    /// for RSA keys). A mismatch is never recoverable.
    pub fn verify(&self, certificate_pem: &str, private_key_pem: &str) -> CertResult<CertificateInfo> {
        let info = self.inspect(certificate_pem)?;

        if !public_key_matches(certificate_pem, private_key_pem)? {
            return Err(CertError::KeyCertificateMismatch(format!(
                "certificate for '{}' was issued for a different key",
                info.subject
            )));
        }

        let days = info.days_remaining();
        if info.is_expired() {
            warn!("Certificate for {} expired on {}", info.subject, info.not_after);
        } else if days <= self.expiry_warning_days {
            warn!("Certificate for {} expires in {} days", info.subject, days);
        }

        info!(
            subject = %info.subject,
            issuer = %info.issuer,
            not_before = %info.not_before,
            not_after = %info.not_after,
            "Certificate verified against private key"
        );

        Ok(info)
    }

    /// Verify a certificate file (PEM or DER) against a key file
    pub fn verify_files(&self, certificate_path: &Path, key_path: &Path) -> CertResult<CertificateInfo> {
        let certificate_pem = load_certificate_file(certificate_path)?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
            CertError::InvalidPrivateKey(format!("cannot read {:?}: {}", key_path, e))
        })?;
        self.verify(&certificate_pem, &key_pem)
    }
}

/// Read a certificate file as PEM, converting DER input
pub fn load_certificate_file(path: &Path) -> CertResult<String> {
    let bytes = std::fs::read(path).map_err(|e| {
        CertError::InvalidCertificateFormat(format!("cannot read {:?}: {}", path, e))
    })?;

    if bytes.is_empty() {
        return Err(CertError::InvalidCertificateFormat(format!(
            "{:?} is empty",
            path
        )));
    }

    match String::from_utf8(bytes) {
        Ok(text) if text.contains("-----BEGIN") => Ok(text),
        Ok(text) => Ok(certificate_pem_from_der(text.as_bytes())),
        Err(e) => Ok(certificate_pem_from_der(e.as_bytes())),
    }
}

/// DER bytes of the first certificate in a PEM document
pub fn certificate_der(certificate_pem: &str) -> CertResult<Vec<u8>> {
    let (_, pem) = parse_x509_pem(certificate_pem.as_bytes())
        .map_err(|e| CertError::InvalidCertificateFormat(format!("not PEM: {}", e)))?;

    if pem.label != "CERTIFICATE" {
        return Err(CertError::InvalidCertificateFormat(format!(
            "expected CERTIFICATE block, found {}",
            pem.label
        )));
    }

    Ok(pem.contents)
}

/// RSA modulus of a certificate's public key (big-endian, no leading zeros)
pub fn certificate_modulus(certificate_pem: &str) -> CertResult<Vec<u8>> {
    let der = certificate_der(certificate_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| CertError::InvalidCertificateFormat(e.to_string()))?;

    match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => Ok(strip_leading_zeros(rsa.modulus)),
        Ok(_) => Err(CertError::KeyCertificateMismatch(
            "certificate does not carry an RSA public key".to_string(),
        )),
        Err(e) => Err(CertError::InvalidCertificateFormat(format!(
            "unreadable public key: {}",
            e
        ))),
    }
}

/// RSA modulus of a CSR's public key
#[cfg(test)]
pub(crate) fn csr_modulus(csr_pem: &str) -> CertResult<Vec<u8>> {
    let (_, pem) = parse_x509_pem(csr_pem.as_bytes())
        .map_err(|e| CertError::CsrGen(format!("not PEM: {}", e)))?;
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| CertError::CsrGen(e.to_string()))?;

    match csr.certification_request_info.subject_pki.parsed() {
        Ok(PublicKey::RSA(rsa)) => Ok(strip_leading_zeros(rsa.modulus)),
        Ok(_) => Err(CertError::CsrGen("CSR does not carry an RSA key".to_string())),
        Err(e) => Err(CertError::CsrGen(e.to_string())),
    }
}

/// Whether a certificate was issued for the public key a CSR carries
///
/// A CSR that cannot be read yields `CsrGen`; an unreadable certificate yields
/// `InvalidCertificateFormat`.
pub fn certificate_matches_csr(certificate_pem: &str, csr_pem: &str) -> CertResult<bool> {
    let (_, pem) = parse_x509_pem(csr_pem.as_bytes())
        .map_err(|e| CertError::CsrGen(format!("not PEM: {}", e)))?;
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| CertError::CsrGen(e.to_string()))?;
    let requested = &csr.certification_request_info.subject_pki;

    let der = certificate_der(certificate_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| CertError::InvalidCertificateFormat(e.to_string()))?;

    match (cert.public_key().parsed(), requested.parsed()) {
        (Ok(PublicKey::RSA(issued)), Ok(PublicKey::RSA(asked))) => {
            Ok(strip_leading_zeros(issued.modulus) == strip_leading_zeros(asked.modulus))
        }
        _ => Ok(cert.public_key().raw == requested.raw),
    }
}

/// Parse an RSA private key from PKCS#8 or PKCS#1 PEM
pub fn parse_private_key(private_key_pem: &str) -> CertResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
        .map_err(|e| CertError::InvalidPrivateKey(e.to_string()))
}

/// RSA modulus of a private key
pub fn private_key_modulus(private_key_pem: &str) -> CertResult<Vec<u8>> {
    let key = parse_private_key(private_key_pem)?;
    Ok(strip_leading_zeros(&key.n().to_bytes_be()))
}

/// Whether a private key is the counterpart of the certificate's public key
///
/// RSA keys are compared by modulus, other algorithms by their encoded public key.
pub fn public_key_matches(certificate_pem: &str, private_key_pem: &str) -> CertResult<bool> {
    if let Ok(key) = parse_private_key(private_key_pem) {
        let key_modulus = strip_leading_zeros(&key.n().to_bytes_be());
        return match certificate_modulus(certificate_pem) {
            Ok(cert_modulus) => Ok(cert_modulus == key_modulus),
            Err(CertError::KeyCertificateMismatch(_)) => Ok(false),
            Err(e) => Err(e),
        };
    }

    let key_pair = parse_key_pair(private_key_pem)?;
    let der = certificate_der(certificate_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| CertError::InvalidCertificateFormat(e.to_string()))?;
    Ok(cert.public_key().raw == key_pair.public_key_der().as_slice())
}

/// Parse a private key of any supported algorithm
///
/// PKCS#8, PKCS#1 and SEC1 blocks are accepted. Tailscale writes SEC1 `EC PRIVATE KEY`.
pub fn parse_key_pair(private_key_pem: &str) -> CertResult<KeyPair> {
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
        .map_err(|e| CertError::InvalidPrivateKey(format!("not PEM: {}", e)))?
        .ok_or_else(|| CertError::InvalidPrivateKey("no private key block found".to_string()))?;

    KeyPair::try_from(&key).map_err(|e| CertError::InvalidPrivateKey(e.to_string()))
}

/// PEM-armor DER certificate bytes
pub fn certificate_pem_from_der(der: &[u8]) -> String {
    let block = pem::Pem::new("CERTIFICATE", der);
    pem::encode_config(
        &block,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
}

fn strip_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

fn certificate_info(cert: &X509Certificate<'_>, der: &[u8]) -> CertResult<CertificateInfo> {
    let validity = cert.validity();
    let not_before = timestamp(validity.not_before.timestamp())?;
    let not_after = timestamp(validity.not_after.timestamp())?;

    let subject_alt_names = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(format!("DNS:{}", dns)),
                GeneralName::IPAddress(bytes) => ip_from_bytes(bytes).map(|ip| format!("IP:{}", ip)),
                _ => None,
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(e) => {
            return Err(CertError::InvalidCertificateFormat(format!(
                "malformed subjectAltName: {}",
                e
            )))
        }
    };

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial: cert.raw_serial_as_string(),
        not_before,
        not_after,
        subject_alt_names,
        fingerprint_sha256: fingerprint(der),
        self_signed: cert.subject().as_raw() == cert.issuer().as_raw(),
    })
}

fn timestamp(seconds: i64) -> CertResult<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| {
        CertError::InvalidCertificateFormat(format!("validity timestamp {} out of range", seconds))
    })
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Colon-separated uppercase SHA-256 fingerprint
pub fn fingerprint(der: &[u8]) -> String {
    let digest = hex::encode_upper(Sha256::digest(der));
    digest
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}
