//! Local self-signed issuance for development

use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use super::keygen::{signing_key_pair, KeyMaterialGenerator};
use crate::models::{CertificateRequest, CertificateSource, IssuedCertificate, KeyMaterial};
use crate::utils::error::{CertError, CertResult};

/// Backdating applied to `notBefore` to tolerate clock skew between hosts
const CLOCK_SKEW_ALLOWANCE: Duration = Duration::minutes(5);

/// Signs certificates with the request's own key
///
/// Uses the same subject template and SAN composition as CSRs, always with the
/// loopback names added. Certificates from here are marked development-only.
#[derive(Debug, Clone)]
pub struct SelfSignedIssuer {
    generator: KeyMaterialGenerator,
}

impl SelfSignedIssuer {
    pub fn new(generator: KeyMaterialGenerator) -> Self {
        Self { generator }
    }

    pub fn issue(&self, request: &CertificateRequest, key: &KeyMaterial) -> CertResult<IssuedCertificate> {
        request.check()?;

        let mut params = self.generator.certificate_params(request, true)?;
        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW_ALLOWANCE;
        params.not_after = now + Duration::days(i64::from(request.validity_days));

        let key_pair = signing_key_pair(key)?;
        let certificate = params
            .self_signed(&key_pair)
            .map_err(|e| CertError::Issuance(format!("self-signing failed: {}", e)))?;

        warn!(
            "Issued SELF-SIGNED certificate for {} (development only, {} days)",
            request.domain, request.validity_days
        );
        info!("Self-signed certificate includes localhost and 127.0.0.1");

        Ok(IssuedCertificate::new(
            certificate.pem(),
            CertificateSource::SelfSigned,
        ))
    }
}
