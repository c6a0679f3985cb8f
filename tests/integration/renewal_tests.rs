//! Roster renewal: failure isolation and the batched reload

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use proptest::prelude::*;

use fleet_certs::config::IssuanceSource;
use fleet_certs::models::{CertificateRequest, RosterEntry};
use fleet_certs::services::renewal::plan;
use fleet_certs::services::{
    CertificatePipeline, PipelineOptions, RenewalScheduler, RenewalTarget,
};
use fleet_certs::utils::error::CertError;

use crate::common::*;

fn targets(count: usize) -> Vec<RenewalTarget> {
    (0..count)
        .map(|i| {
            let domain = format!("svc{}.internal", i);
            RenewalTarget::new(CertificateRequest::new(domain.clone()))
                .with_site(RosterEntry::new(domain, format!("svc{}", i), 9000 + i as u16))
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_failures_are_isolated(
        count in 1usize..8,
        failing_mask in proptest::collection::vec(any::<bool>(), 8),
    ) {
        let targets = targets(count);
        let failing: BTreeSet<String> = targets
            .iter()
            .zip(&failing_mask)
            .filter(|(_, fail)| **fail)
            .map(|(t, _)| t.domain().to_string())
            .collect();

        let renewer = Arc::new(FlakyRenewer::failing(failing.clone()));
        let scheduler = RenewalScheduler::new(renewer.clone(), targets.clone());
        let summary = tokio_test::block_on(scheduler.run());

        // Every entry attempted exactly once, in roster order
        let expected: Vec<String> = targets.iter().map(|t| t.domain().to_string()).collect();
        prop_assert_eq!(renewer.calls.lock().unwrap().clone(), expected);
        prop_assert_eq!(renewer.reloads.load(Ordering::SeqCst), 1);

        prop_assert_eq!(summary.failed(), failing.len());
        prop_assert_eq!(summary.succeeded(), count - failing.len());
        for entry in &summary.entries {
            prop_assert_eq!(entry.succeeded(), !failing.contains(&entry.domain));
        }

        match summary.into_result() {
            Ok(_) => prop_assert!(failing.is_empty()),
            Err(CertError::PartialRosterFailure { failed, total }) => {
                prop_assert_eq!(failed, failing.len());
                prop_assert_eq!(total, count);
            }
            Err(other) => prop_assert!(false, "unexpected error: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_self_signed_roster_run_reloads_once() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.roster = roster();
    config.renewal.main_identity = Some(domains::MAIN_IDENTITY.to_string());
    config.renewal.source = IssuanceSource::SelfSigned;

    let proxy = Arc::new(FakeProxy::default());
    let options = PipelineOptions {
        reload: false,
        ..PipelineOptions::from_config(&config)
    };
    let pipeline = CertificatePipeline::new(&config, options, Arc::new(ScriptedPrompt::absent()))
        .unwrap()
        .with_proxy_controller(proxy.clone());

    let summary = RenewalScheduler::new(Arc::new(pipeline), plan(&config))
        .run()
        .await;

    assert_eq!(summary.total(), 3);
    assert_eq!(summary.failed(), 0);
    assert_eq!(proxy.reload_count(), 1);
    assert!(summary.reload_attempted);

    for site in ["grafana", "ollama"] {
        assert!(root.path().join("nginx/sites-available").join(site).exists());
    }
    let ollama = std::fs::read_to_string(root.path().join("nginx/sites-available/ollama")).unwrap();
    assert!(ollama.contains("proxy_pass http://127.0.0.1:11434;"));

    // The wildcard identity is installed but has no site of its own
    assert!(root.path().join("ssl/certs/_wildcard.internal.crt").exists());
    assert!(summary.entries[2].report.as_ref().unwrap().site_config.is_none());
    assert!(summary.into_result().is_ok());
}

#[tokio::test]
async fn test_one_locked_entry_does_not_block_the_rest() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.roster = roster();
    config.renewal.source = IssuanceSource::SelfSigned;

    let pipeline = CertificatePipeline::new(
        &config,
        PipelineOptions::from_config(&config),
        Arc::new(ScriptedPrompt::absent()),
    )
    .unwrap()
    .with_proxy_controller(Arc::new(FakeProxy::default()));

    let _held = fleet_certs::services::DomainLock::acquire(&config.lock_dir, domains::GRAFANA).unwrap();
    let summary = RenewalScheduler::new(Arc::new(pipeline), plan(&config))
        .run()
        .await;

    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.entries[0].error.as_ref().unwrap().exit_code, 7);
    assert!(summary.entries[1].succeeded());
    let err = summary.into_result().unwrap_err();
    assert_eq!(err.exit_code(), 8);
}
