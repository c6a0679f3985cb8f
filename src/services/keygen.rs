//! Key and CSR generation, and the per-invocation scratch workspace

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, KeyPair,
    KeyUsagePurpose, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use tempfile::TempDir;
use tracing::{debug, info};

use super::verifier::{parse_key_pair, parse_private_key};
use crate::config::SubjectConfig;
use crate::models::{CertificateRequest, KeyMaterial, SubjectAltName};
use crate::utils::error::{CertError, CertResult};
use crate::utils::validation::{file_stem_for_domain, validate_key_size, SUPPORTED_KEY_SIZES};

/// Scoped scratch directory for one invocation's key, CSR and certificate
///
/// The directory and everything in it is removed when the workspace is dropped,
/// including when the owning future is cancelled.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a private (0700) scratch directory under `parent` or the system temp dir
    pub fn create(parent: Option<&Path>) -> CertResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("fleet-certs-");

        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;

        debug!("Created workspace {:?}", dir.path());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.path().join(format!("{}.key", file_stem_for_domain(domain)))
    }

    pub fn csr_path(&self, domain: &str) -> PathBuf {
        self.path().join(format!("{}.csr", file_stem_for_domain(domain)))
    }

    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.path().join(format!("{}.crt", file_stem_for_domain(domain)))
    }

    /// Write a file readable only by the owner
    pub fn write_private(&self, path: &Path, contents: &[u8]) -> CertResult<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents)?;
        Ok(())
    }

    /// Write a world-readable file
    pub fn write_public(&self, path: &Path, contents: &[u8]) -> CertResult<()> {
        std::fs::write(path, contents)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
        Ok(())
    }
}

/// Key and CSR produced for one request
#[derive(Debug)]
pub struct GeneratedMaterial {
    pub key: KeyMaterial,
    pub csr_pem: String,
    pub key_path: PathBuf,
    pub csr_path: PathBuf,
}

/// Generates RSA keys and PKCS#10 requests with a fixed subject template
#[derive(Debug, Clone)]
pub struct KeyMaterialGenerator {
    subject: SubjectConfig,
}

impl KeyMaterialGenerator {
    pub fn new(subject: SubjectConfig) -> Self {
        Self { subject }
    }

    /// Generate an RSA private key
    pub fn generate_key(&self, bits: u32) -> CertResult<KeyMaterial> {
        if !validate_key_size(bits) {
            return Err(CertError::KeyGen(format!(
                "unsupported key size {} (supported: {:?})",
                bits, SUPPORTED_KEY_SIZES
            )));
        }

        info!("Generating {}-bit RSA key", bits);
        let key = RsaPrivateKey::new(&mut OsRng, bits as usize)
            .map_err(|e| CertError::KeyGen(e.to_string()))?;
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CertError::KeyGen(format!("failed to encode key: {}", e)))?;

        Ok(KeyMaterial::new(pem, bits))
    }

    /// Certificate parameters: DN template, CN = domain, SANs, server usages
    pub fn certificate_params(
        &self,
        request: &CertificateRequest,
        include_loopback: bool,
    ) -> CertResult<CertificateParams> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        for (kind, value) in [
            (DnType::CountryName, &self.subject.country),
            (DnType::StateOrProvinceName, &self.subject.state),
            (DnType::LocalityName, &self.subject.locality),
            (DnType::OrganizationName, &self.subject.organization),
            (DnType::OrganizationalUnitName, &self.subject.organizational_unit),
        ] {
            if !value.is_empty() {
                dn.push(kind, value.as_str());
            }
        }
        dn.push(DnType::CommonName, request.domain.as_str());
        params.distinguished_name = dn;

        params.subject_alt_names = request
            .subject_alt_names(include_loopback)
            .into_iter()
            .map(|san| match san {
                SubjectAltName::Dns(name) => Ia5String::try_from(name.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| CertError::CsrGen(format!("invalid DNS SAN '{}': {}", name, e))),
                SubjectAltName::Ip(ip) => Ok(SanType::IpAddress(ip)),
            })
            .collect::<CertResult<Vec<_>>>()?;

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        Ok(params)
    }

    /// PEM-encoded CSR for the request, signed with `key`
    pub fn generate_csr(
        &self,
        request: &CertificateRequest,
        key: &KeyMaterial,
        include_loopback: bool,
    ) -> CertResult<String> {
        let key_pair = signing_key_pair(key)?;
        let params = self.certificate_params(request, include_loopback)?;

        params
            .serialize_request(&key_pair)
            .and_then(|csr| csr.pem())
            .map_err(|e| CertError::CsrGen(e.to_string()))
    }

    /// Key and CSR for the request, written into the workspace
    pub fn generate(
        &self,
        request: &CertificateRequest,
        workspace: &Workspace,
        include_loopback: bool,
    ) -> CertResult<GeneratedMaterial> {
        request.check()?;

        let key = self.generate_key(request.key_size)?;
        let csr_pem = self.generate_csr(request, &key, include_loopback)?;

        let key_path = workspace.key_path(&request.domain);
        let csr_path = workspace.csr_path(&request.domain);
        workspace.write_private(&key_path, key.private_key_pem().as_bytes())?;
        workspace.write_public(&csr_path, csr_pem.as_bytes())?;

        info!("Generated key and CSR for {}", request.domain);

        Ok(GeneratedMaterial {
            key,
            csr_pem,
            key_path,
            csr_path,
        })
    }
}

/// rcgen key pair for signing with locally generated key material
pub(crate) fn signing_key_pair(key: &KeyMaterial) -> CertResult<KeyPair> {
    KeyPair::from_pem(key.private_key_pem())
        .map_err(|e| CertError::CsrGen(format!("key not usable for signing: {}", e)))
}

/// Wrap an externally supplied key (RSA PKCS#8/PKCS#1, or EC PKCS#8/SEC1 PEM)
pub fn key_material_from_pem(pem: &str) -> CertResult<KeyMaterial> {
    let bits = match parse_private_key(pem) {
        Ok(key) => (key.size() * 8) as u32,
        Err(_) => {
            let key_pair = parse_key_pair(pem)?;
            match key_pair.algorithm() {
                alg if alg == &rcgen::PKCS_ECDSA_P384_SHA384 => 384,
                alg if alg == &rcgen::PKCS_ECDSA_P521_SHA512 => 521,
                _ => 256,
            }
        }
    };
    Ok(KeyMaterial::new(zeroize::Zeroizing::new(pem.to_string()), bits))
}
