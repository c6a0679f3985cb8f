//! Certificate and key verification

use std::sync::{Arc, OnceLock};

use proptest::prelude::*;

use fleet_certs::config::SubjectConfig;
use fleet_certs::models::{CertificateRequest, IssuedCertificate, CertificateSource};
use fleet_certs::services::{
    CertificatePipeline, CertificateVerifier, KeyMaterialGenerator, PipelineOptions, RenewalTarget,
    SelfSignedIssuer,
};
use fleet_certs::services::keygen::key_material_from_pem;
use fleet_certs::utils::error::CertError;

use crate::common::*;

/// (certificate PEM, key PEM) pairs, generated once: RSA keys are slow to make
fn pairs() -> &'static [(String, String)] {
    static PAIRS: OnceLock<Vec<(String, String)>> = OnceLock::new();
    PAIRS.get_or_init(|| {
        let generator = KeyMaterialGenerator::new(SubjectConfig::default());
        let issuer = SelfSignedIssuer::new(generator.clone());
        (0..3)
            .map(|i| {
                let request = CertificateRequest::new(format!("pool{}.internal", i));
                let key = generator.generate_key(2048).unwrap();
                let issued = issuer.issue(&request, &key).unwrap();
                (issued.certificate_pem, key.private_key_pem().to_string())
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_only_the_issuing_key_verifies(cert_index in 0usize..3, key_index in 0usize..3) {
        let (certificate, _) = &pairs()[cert_index];
        let (_, key) = &pairs()[key_index];

        let result = CertificateVerifier::new().verify(certificate, key);

        if cert_index == key_index {
            prop_assert!(result.is_ok());
        } else {
            let err = result.unwrap_err();
            prop_assert!(matches!(err, CertError::KeyCertificateMismatch(_)));
            prop_assert_eq!(err.exit_code(), 5);
        }
    }
}

#[test]
fn test_chain_is_verified_by_its_leaf() {
    let (leaf, key) = &pairs()[0];
    let ca = TestCa::new();
    let chain = format!("{}{}", leaf, ca.pem());

    let info = CertificateVerifier::new().verify(&chain, key).unwrap();
    assert!(info.subject.contains("pool0.internal"));
}

#[test]
fn test_truncated_certificate_is_invalid_format() {
    let (certificate, key) = &pairs()[0];
    let truncated = &certificate[..certificate.len() / 2];

    let err = CertificateVerifier::new().verify(truncated, key).unwrap_err();
    assert!(matches!(err, CertError::InvalidCertificateFormat(_)));
}

#[tokio::test]
async fn test_mismatched_pair_is_never_installed() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let proxy = Arc::new(FakeProxy::default());
    let pipeline = CertificatePipeline::new(
        &config,
        PipelineOptions::from_config(&config),
        Arc::new(ScriptedPrompt::absent()),
    )
    .unwrap()
    .with_proxy_controller(proxy.clone());

    let (certificate, _) = &pairs()[0];
    let (_, other_key) = &pairs()[1];
    let issued = IssuedCertificate::new(certificate.clone(), CertificateSource::SelfSigned)
        .with_issuer_key(key_material_from_pem(other_key).unwrap());

    let err = pipeline
        .install_existing(&RenewalTarget::new(CertificateRequest::new("pool0.internal")), issued)
        .await
        .unwrap_err();

    assert!(matches!(err, CertError::KeyCertificateMismatch(_)));
    assert!(err.blocks_installation());
    assert!(!root.path().join("ssl/certs/pool0.internal.crt").exists());
    assert!(!root.path().join("nginx/ssl/pool0.internal.key").exists());
    assert_eq!(proxy.reload_count(), 0);
}
