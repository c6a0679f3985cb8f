//! Subcommand implementations shared by both binaries

use std::fs::OpenOptions;
use std::io::{IsTerminal, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::{AppConfig, IssuanceSource};
use crate::models::{
    CertificateInfo, CertificateRequest, CertificateSource, EndpointStatus, HealthReport,
    IssuedCertificate, ProbeOutcome, RosterEntry,
};
use crate::services::keygen::key_material_from_pem;
use crate::services::manual_fallback::{
    ManualFallbackPresenter, ManualRequest, NonInteractivePrompt, OperatorPrompt, TerminalPrompt,
};
use crate::services::renewal::{plan, EntryResult};
use crate::services::verifier::load_certificate_file;
use crate::services::{
    CaClient, CaHealthMonitor, CertificatePipeline, CertificateRequestNegotiator, CertificateVerifier,
    EndpointProbe, KeyMaterialGenerator, NegotiationOutcome, PipelineOptions, PipelineReport,
    RenewalScheduler, RenewalSummary, RenewalTarget,
};
use crate::utils::error::{CertError, CertResult};

/// Run the selected subcommand; the returned code is the process exit status
pub async fn execute(cli: &Cli, mut config: AppConfig) -> CertResult<u8> {
    let prompt = operator_prompt(cli.non_interactive);

    match &cli.command {
        Commands::Request {
            request,
            ca,
            self_signed_fallback,
            no_reload,
            json,
        } => {
            ca.apply(&mut config.ca);
            let options = PipelineOptions {
                source: IssuanceSource::Ca,
                fallback_to_self_signed: *self_signed_fallback || config.renewal.fallback_to_self_signed,
                reload: !no_reload,
            };
            let pipeline = CertificatePipeline::new(&config, options, prompt)?;
            let report = pipeline.run(&target_for(&config, request.to_request())).await?;
            print_pipeline_report(&report, *json)?;
            Ok(0)
        }

        Commands::SelfSigned {
            request,
            no_reload,
            json,
        } => {
            let options = PipelineOptions {
                source: IssuanceSource::SelfSigned,
                fallback_to_self_signed: false,
                reload: !no_reload,
            };
            let pipeline = CertificatePipeline::new(&config, options, prompt)?;
            let report = pipeline.run(&target_for(&config, request.to_request())).await?;
            print_pipeline_report(&report, *json)?;
            Ok(0)
        }

        Commands::Tailscale {
            domain,
            port,
            no_reload,
            json,
        } => {
            let mut request = CertificateRequest::new(domain.clone());
            if let Some(port) = port {
                request = request.with_port(*port);
            }
            let options = PipelineOptions {
                source: IssuanceSource::Tailscale,
                fallback_to_self_signed: false,
                reload: !no_reload,
            };
            let pipeline = CertificatePipeline::new(&config, options, prompt)?;
            let report = pipeline.run(&target_for(&config, request)).await?;
            print_pipeline_report(&report, *json)?;
            Ok(0)
        }

        Commands::Generate { request, out } => {
            generate(&config, &request.to_request(), out)?;
            Ok(0)
        }

        Commands::Submit {
            request,
            ca,
            csr,
            out,
        } => {
            ca.apply(&mut config.ca);
            submit(&config, &request.to_request(), csr, out, prompt).await?;
            Ok(0)
        }

        Commands::Verify { cert, key, json } => {
            let info = CertificateVerifier::new().verify_files(cert, key)?;
            if *json {
                print_json(&info)?;
            } else {
                println!("[OK] Certificate and private key match");
                print_certificate_info(&info);
            }
            Ok(0)
        }

        Commands::Install {
            cert,
            key,
            domain,
            port,
            format,
            development,
            no_reload,
            json,
        } => {
            let certificate_pem = load_certificate_file(cert)?;
            let key_pem = std::fs::read_to_string(key).map_err(|e| {
                CertError::InvalidPrivateKey(format!("cannot read {:?}: {}", key, e))
            })?;
            let source = if *development {
                CertificateSource::SelfSigned
            } else {
                CertificateSource::Manual { path: cert.clone() }
            };
            let issued = IssuedCertificate::new(certificate_pem, source)
                .with_issuer_key(key_material_from_pem(&key_pem)?);

            let mut request = CertificateRequest::new(domain.clone()).with_output_format(*format);
            if let Some(port) = port {
                request = request.with_port(*port);
            }

            let options = PipelineOptions {
                reload: !no_reload,
                ..PipelineOptions::from_config(&config)
            };
            let pipeline = CertificatePipeline::new(&config, options, prompt)?;
            let report = pipeline
                .install_existing(&target_for(&config, request), issued)
                .await?;
            print_pipeline_report(&report, *json)?;
            Ok(0)
        }

        Commands::Probe { paths, ca } => {
            ca.apply(&mut config.ca);
            let paths = if paths.is_empty() {
                config.ca.health_paths.clone()
            } else {
                paths.clone()
            };
            let probe = EndpointProbe::new(CaClient::new(&config.ca)?);
            let statuses = probe.probe_all(&paths).await;
            print_probe_results(probe.base_url(), &statuses);

            if !statuses.is_empty()
                && statuses
                    .iter()
                    .all(|s| matches!(s.outcome, ProbeOutcome::ConnectionFailed(_)))
            {
                return Err(CertError::Connectivity(format!(
                    "no connection to {}",
                    probe.base_url()
                )));
            }
            Ok(0)
        }

        Commands::Health { ca, json } => {
            ca.apply(&mut config.ca);
            let client = CaClient::new(&config.ca)?;
            let report = CaHealthMonitor::new(client, &config.ca, &config.subject)
                .check()
                .await;
            if *json {
                print_json(&report)?;
            } else {
                print_health_report(&report);
            }
            Ok(report.classification.exit_code())
        }

        Commands::Renew { dry_run, json } => {
            renew(&config, prompt, *dry_run, *json).await?;
            Ok(0)
        }
    }
}

/// Terminal prompt when someone can answer, otherwise fail-fast
pub fn operator_prompt(non_interactive: bool) -> Arc<dyn OperatorPrompt> {
    if non_interactive || !std::io::stdin().is_terminal() {
        Arc::new(NonInteractivePrompt)
    } else {
        Arc::new(TerminalPrompt)
    }
}

/// Attach the proxy site: the roster entry when the domain has one, else the requested port
pub fn target_for(config: &AppConfig, request: CertificateRequest) -> RenewalTarget {
    let site = match config.roster_entry(&request.domain) {
        Some(entry) => Some(entry.clone()),
        None => request
            .port
            .map(|port| RosterEntry::ad_hoc(&request.domain, port)),
    };

    let target = RenewalTarget::new(request);
    match site {
        Some(site) => target.with_site(site),
        None => target,
    }
}

/// Renew the roster once; shared by `fleet-certs renew` and `renew-certificates`
pub async fn renew(
    config: &AppConfig,
    prompt: Arc<dyn OperatorPrompt>,
    dry_run: bool,
    json: bool,
) -> CertResult<Option<RenewalSummary>> {
    let targets = plan(config);

    if dry_run {
        print_plan(config, &targets);
        return Ok(None);
    }

    let options = PipelineOptions {
        reload: false,
        ..PipelineOptions::from_config(config)
    };
    let pipeline = Arc::new(CertificatePipeline::new(config, options, prompt)?);
    let summary = RenewalScheduler::new(pipeline, targets).run().await;

    if json {
        print_json(&summary)?;
    } else {
        print_summary(&summary);
    }

    summary.into_result().map(Some)
}

/// Write `<domain>.key` (0600) and `<domain>.csr` (0644) into `out`
fn generate(config: &AppConfig, request: &CertificateRequest, out: &Path) -> CertResult<()> {
    request.check()?;
    let generator = KeyMaterialGenerator::new(config.subject.clone());
    let key = generator.generate_key(request.key_size)?;
    let csr_pem = generator.generate_csr(request, &key, false)?;

    std::fs::create_dir_all(out)?;
    let stem = crate::utils::validation::file_stem_for_domain(&request.domain);
    let key_path = out.join(format!("{}.key", stem));
    let csr_path = out.join(format!("{}.csr", stem));
    write_with_mode(&key_path, key.private_key_pem().as_bytes(), 0o600)?;
    write_with_mode(&csr_path, csr_pem.as_bytes(), 0o644)?;

    info!("Wrote {:?} and {:?}", key_path, csr_path);
    println!("{}", csr_pem.trim_end());
    Ok(())
}

async fn submit(
    config: &AppConfig,
    request: &CertificateRequest,
    csr: &Path,
    out: &Path,
    prompt: Arc<dyn OperatorPrompt>,
) -> CertResult<()> {
    request.check()?;
    let csr_pem = std::fs::read_to_string(csr)
        .map_err(|e| CertError::InvalidRequest(format!("cannot read CSR {:?}: {}", csr, e)))?;

    let negotiator = CertificateRequestNegotiator::new(CaClient::new(&config.ca)?, &config.ca);
    let issued = match negotiator.negotiate(request, &csr_pem).await {
        NegotiationOutcome::Issued { certificate, .. } => {
            write_with_mode(out, certificate.certificate_pem.as_bytes(), 0o644)?;
            certificate
        }
        NegotiationOutcome::Exhausted {
            ca_reachable: false,
            ..
        } => {
            return Err(CertError::Connectivity(format!(
                "CA at {} refused every connection",
                negotiator.base_url()
            )))
        }
        NegotiationOutcome::Exhausted { attempts, .. } => {
            warn!("{}", CertError::NegotiationExhausted { attempts: attempts.len() });
            let presenter = ManualFallbackPresenter::new(
                prompt,
                Duration::from_secs(config.renewal.manual_wait_secs),
            );
            presenter
                .present(ManualRequest {
                    ca_url: negotiator.base_url(),
                    request,
                    csr_pem: &csr_pem,
                    destination: out,
                    attempts: &attempts,
                })
                .await?
        }
    };

    if let Some(ref key) = issued.issuer_key {
        let key_path = out.with_extension("key");
        write_with_mode(&key_path, key.private_key_pem().as_bytes(), 0o600)?;
        println!("Private key from the CA written to {}", key_path.display());
    }

    let info = CertificateVerifier::new().inspect(&issued.certificate_pem)?;
    println!("[OK] Certificate from {} written to {}", issued.source.label(), out.display());
    print_certificate_info(&info);
    Ok(())
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> CertResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> CertResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_certificate_info(info: &CertificateInfo) {
    println!("  Subject:     {}", info.subject);
    println!("  Issuer:      {}", info.issuer);
    println!("  Serial:      {}", info.serial);
    println!("  Not before:  {}", info.not_before);
    println!(
        "  Not after:   {} ({} days remaining)",
        info.not_after,
        info.days_remaining()
    );
    if !info.subject_alt_names.is_empty() {
        println!("  SANs:        {}", info.subject_alt_names.join(", "));
    }
    println!("  SHA-256:     {}", info.fingerprint_sha256);
    if info.self_signed {
        println!("  Self-signed: yes (development only)");
    }
}

fn print_pipeline_report(report: &PipelineReport, json: bool) -> CertResult<()> {
    if json {
        return print_json(report);
    }

    println!("[OK] {} issued by {}", report.domain, report.source.label());
    print_certificate_info(&report.certificate);
    for replica in &report.installed.replicas {
        println!(
            "  Installed:   {} ({}, key {})",
            replica.certificate_path.display(),
            replica.store,
            replica.key_path.display()
        );
    }
    if let Some(ref site) = report.site_config {
        println!(
            "  Proxy site:  {}{}",
            site.display(),
            if report.reloaded { " (reloaded)" } else { "" }
        );
    }
    if !report.attempts.is_empty() {
        println!("  CA attempts: {}", report.attempts.len());
    }
    Ok(())
}

fn print_probe_results(base_url: &str, statuses: &[EndpointStatus]) {
    println!("CA: {}", base_url);
    for status in statuses {
        println!("  {:<32} {}", status.path, status.outcome);
    }
}

fn print_health_report(report: &HealthReport) {
    println!("CA health: {} ({})", report.classification, report.base_url);
    println!("  Root: {}", report.root);
    for status in &report.endpoints {
        println!("  {:<32} {}", status.path, status.outcome);
    }
    if !report.trial_attempts.is_empty() {
        println!("  Trial issuance attempts: {}", report.trial_attempts.len());
    }
}

fn print_plan(config: &AppConfig, targets: &[RenewalTarget]) {
    println!("Dry run: {} identities would be renewed", targets.len());
    println!("  Source: {:?}", config.renewal.source);
    for target in targets {
        match target.site {
            Some(ref site) => println!(
                "  - {} (site {}, port {} -> {}:{})",
                target.domain(),
                site.site,
                site.port,
                config.proxy.upstream_host,
                site.upstream_port()
            ),
            None => println!("  - {}", target.domain()),
        }
    }
}

/// One line per roster entry, then totals
pub fn print_summary(summary: &RenewalSummary) {
    for entry in &summary.entries {
        print_entry(entry);
    }
    if let Some(ref reason) = summary.reload_error {
        println!("[FAIL] proxy reload: {}", reason);
    }
    println!(
        "\nSummary: {} succeeded, {} failed",
        summary.succeeded(),
        summary.failed()
    );
}

fn print_entry(entry: &EntryResult) {
    match (&entry.report, &entry.error) {
        (Some(report), _) => println!(
            "[OK] {} - {} (expires {})",
            entry.domain,
            report.source.label(),
            report.certificate.not_after.format("%Y-%m-%d")
        ),
        (None, Some(error)) => println!("[FAIL] {} - {}", entry.domain, error.message),
        (None, None) => println!("[FAIL] {} - no result", entry.domain),
    }
}
