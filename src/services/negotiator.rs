//! Certificate request negotiation against an under-specified CA API
//!
//! The CA's interface differs between deployments, so a request is tried against an
//! ordered catalog of endpoints, each with an ordered list of payload encodings. The
//! first response that carries a recognizable certificate for the request's key (or
//! for a key returned alongside it) wins. Transport failures and non-matching
//! responses are recorded and the next combination is tried.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::multipart::{Form, Part};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::ca_client::{CaClient, CaResponse};
use super::keygen::key_material_from_pem;
use super::probe::{describe_transport_error, EndpointProbe};
use super::verifier::{certificate_matches_csr, certificate_pem_from_der, public_key_matches};
use crate::config::CaConfig;
use crate::models::{
    AttemptOutcome, AttemptRecord, CertificateRequest, CertificateSource, EndpointCandidate,
    FieldLayout, IssuedCertificate, PayloadEncoding,
};
use crate::utils::error::CertError;

/// Endpoint served by current CA deployments
pub const CANONICAL_ENDPOINT: &str = "/api/generate-cert";

/// Endpoints tried when the configuration does not supply a catalog
pub fn default_catalog() -> Vec<EndpointCandidate> {
    vec![
        EndpointCandidate::canonical(CANONICAL_ENDPOINT),
        EndpointCandidate::legacy("/api/certificates/request"),
        EndpointCandidate::legacy("/api/cert/request"),
        EndpointCandidate::legacy("/api/sign"),
        EndpointCandidate::legacy("/api/csr/sign"),
        EndpointCandidate::legacy("/certificates/sign"),
    ]
}

/// Where in a JSON response a certificate may live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// `{"certificate": "..."}`
    Certificate,
    /// `{"cert": "..."}`
    Cert,
    /// `{"data": {"certificate": "..."}}`
    DataCertificate,
}

impl ExtractionStrategy {
    /// Strategies in the order they are tried
    pub const ORDER: [ExtractionStrategy; 3] = [
        ExtractionStrategy::Certificate,
        ExtractionStrategy::Cert,
        ExtractionStrategy::DataCertificate,
    ];

    fn pointer(&self) -> &'static str {
        match self {
            ExtractionStrategy::Certificate => "/certificate",
            ExtractionStrategy::Cert => "/cert",
            ExtractionStrategy::DataCertificate => "/data/certificate",
        }
    }

    /// Non-empty string at this strategy's location
    pub fn extract<'a>(&self, body: &'a Value) -> Option<&'a str> {
        non_empty_str(body, self.pointer())
    }
}

/// Locations of a CA-generated private key, in lookup order
const KEY_POINTERS: [&str; 4] = ["/privateKey", "/key", "/private_key", "/data/privateKey"];

/// First certificate found by the extraction strategies
pub fn extract_certificate(body: &Value) -> Option<(ExtractionStrategy, String)> {
    ExtractionStrategy::ORDER
        .iter()
        .find_map(|s| s.extract(body).map(|cert| (*s, normalize_certificate(cert))))
}

/// First CA-generated private key in the response, if any
pub fn extract_private_key(body: &Value) -> Option<&str> {
    KEY_POINTERS.iter().find_map(|p| non_empty_str(body, p))
}

fn non_empty_str<'a>(body: &'a Value, pointer: &str) -> Option<&'a str> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// PEM text as-is; bare base64 DER is wrapped into PEM
fn normalize_certificate(text: &str) -> String {
    if text.contains("-----BEGIN") {
        return format!("{}\n", text.trim_end());
    }

    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    match BASE64.decode(compact.as_bytes()) {
        Ok(der) => certificate_pem_from_der(&der),
        Err(_) => text.to_string(),
    }
}

/// Reporting fields a CA may include alongside (or instead of) a certificate
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResponseMetadata {
    pub success: Option<bool>,
    pub error: Option<String>,
    pub details: Option<String>,
    pub warnings: Vec<String>,
    pub output: Option<String>,
}

impl ResponseMetadata {
    pub fn from_body(body: &Value) -> Self {
        let text = |key: &str| match body.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Null) | None => None,
            Some(Value::String(_)) => None,
            Some(other) => Some(other.to_string()),
        };

        let warnings = match body.get("warnings") {
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|w| match w {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };

        Self {
            success: body.get("success").and_then(Value::as_bool),
            error: text("error"),
            details: text("details"),
            warnings,
            output: text("output"),
        }
    }

    /// Message worth showing the operator
    pub fn message(&self) -> Option<String> {
        match (&self.error, &self.details) {
            (Some(error), Some(details)) => Some(format!("{} ({})", error, details)),
            (Some(error), None) => Some(error.clone()),
            (None, Some(details)) => Some(details.clone()),
            (None, None) => None,
        }
    }
}

/// Result of a negotiation run
#[derive(Debug)]
pub enum NegotiationOutcome {
    /// A certificate was obtained
    Issued {
        certificate: IssuedCertificate,
        attempts: Vec<AttemptRecord>,
    },
    /// Every combination was tried without success
    Exhausted {
        attempts: Vec<AttemptRecord>,
        /// False when the CA refused connections before anything was submitted
        ca_reachable: bool,
    },
}

impl NegotiationOutcome {
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            NegotiationOutcome::Issued { attempts, .. } => attempts,
            NegotiationOutcome::Exhausted { attempts, .. } => attempts,
        }
    }
}

/// Obtains certificates from the CA by trying endpoint × encoding combinations
pub struct CertificateRequestNegotiator {
    client: CaClient,
    probe: EndpointProbe,
    catalog: Vec<EndpointCandidate>,
    requested_by: String,
    ca_password: Option<String>,
    probe_before_submit: bool,
}

impl CertificateRequestNegotiator {
    pub fn new(client: CaClient, config: &CaConfig) -> Self {
        let catalog = if config.endpoints.is_empty() {
            default_catalog()
        } else {
            config.endpoints.clone()
        };

        Self {
            probe: EndpointProbe::new(client.clone()),
            client,
            catalog,
            requested_by: config.requested_by.clone(),
            ca_password: config.ca_password.clone(),
            probe_before_submit: config.probe_before_submit,
        }
    }

    /// Replace the endpoint catalog
    pub fn with_catalog(mut self, catalog: Vec<EndpointCandidate>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn catalog(&self) -> &[EndpointCandidate] {
        &self.catalog
    }

    pub fn base_url(&self) -> &str {
        self.client.base_url()
    }

    /// Try every catalog entry in order until one yields a certificate
    pub async fn negotiate(
        &self,
        request: &CertificateRequest,
        csr_pem: &str,
    ) -> NegotiationOutcome {
        let base_url = self.client.base_url();
        info!("Requesting certificate for {} from {}", request.domain, base_url);

        // Only a refused or unreachable connection stops negotiation before it starts
        match self.client.get("/").await {
            Ok(response) => debug!(status = response.status, "CA root answered"),
            Err(e) if e.is_connect() => {
                warn!(
                    "CA at {} is unreachable ({}); nothing submitted",
                    base_url,
                    describe_transport_error(&e)
                );
                return NegotiationOutcome::Exhausted {
                    attempts: Vec::new(),
                    ca_reachable: false,
                };
            }
            Err(e) => warn!(
                "CA root at {} did not answer ({}); submitting anyway",
                base_url,
                describe_transport_error(&e)
            ),
        }

        let mut attempts = Vec::new();

        for candidate in &self.catalog {
            if self.probe_before_submit {
                let outcome = self.probe.probe(&candidate.path).await;
                if outcome.endpoint_exists() {
                    info!("{} looks present ({})", candidate.path, outcome);
                } else {
                    info!("{} probe returned {}; submitting anyway", candidate.path, outcome);
                }
            }

            for encoding in &candidate.encodings {
                let sequence = attempts.len() + 1;
                info!(
                    "Attempt {}: {} {} as {}",
                    sequence, candidate.method, candidate.path, encoding
                );

                let result = self.submit(candidate, *encoding, request, csr_pem).await;
                let (record, issued) =
                    self.evaluate(sequence, candidate, *encoding, csr_pem, result);

                match issued {
                    Some(certificate) => {
                        info!(
                            "Certificate issued by {} ({} encoding)",
                            candidate.path, encoding
                        );
                        attempts.push(record);
                        return NegotiationOutcome::Issued {
                            certificate,
                            attempts,
                        };
                    }
                    None => {
                        warn!(
                            "{} via {} gave no certificate ({}); trying next combination",
                            candidate.path,
                            encoding,
                            describe_attempt(&record)
                        );
                        attempts.push(record);
                    }
                }
            }
        }

        warn!(
            "All {} endpoint/encoding combinations failed for {}",
            attempts.len(),
            request.domain
        );
        NegotiationOutcome::Exhausted {
            attempts,
            ca_reachable: true,
        }
    }

    async fn submit(
        &self,
        candidate: &EndpointCandidate,
        encoding: PayloadEncoding,
        request: &CertificateRequest,
        csr_pem: &str,
    ) -> Result<CaResponse, reqwest::Error> {
        let fields = self.fields(candidate.layout, request, csr_pem);

        match encoding {
            PayloadEncoding::Json => {
                self.client
                    .submit_json(candidate.method, &candidate.path, &Value::Object(fields))
                    .await
            }
            PayloadEncoding::Multipart => {
                let mut form = Form::new();
                for (key, value) in &fields {
                    if key == "csr" {
                        continue;
                    }
                    form = form.text(key.clone(), form_value(value));
                }
                form = form.part("csr", csr_part(request, csr_pem)?);
                self.client
                    .submit_multipart(candidate.method, &candidate.path, form)
                    .await
            }
            PayloadEncoding::FormUrlEncoded => {
                let mut pairs: Vec<(&str, String)> = fields
                    .iter()
                    .filter(|(key, _)| key.as_str() != "csr")
                    .map(|(key, value)| (key.as_str(), form_value(value)))
                    .collect();
                pairs.push(("csr", BASE64.encode(csr_pem.as_bytes())));
                pairs.push(("csrEncoding", "base64".to_string()));
                self.client
                    .submit_form(candidate.method, &candidate.path, &pairs)
                    .await
            }
        }
    }

    /// Request fields for a layout
    pub fn fields(
        &self,
        layout: FieldLayout,
        request: &CertificateRequest,
        csr_pem: &str,
    ) -> Map<String, Value> {
        let mut fields = Map::new();

        match layout {
            FieldLayout::Canonical => {
                fields.insert("csr".into(), csr_pem.into());
                fields.insert("serverName".into(), request.domain.clone().into());
                if let Some(ip) = request.ip {
                    fields.insert("serverIp".into(), ip.to_string().into());
                }
                fields.insert(
                    "certificateType".into(),
                    request.certificate_type.as_str().into(),
                );
                fields.insert("validityDays".into(), request.validity_days.into());
                fields.insert("keySize".into(), request.key_size.into());
                fields.insert("outputFormat".into(), request.output_format.as_str().into());
                if let Some(ref password) = self.ca_password {
                    fields.insert("caPassword".into(), password.clone().into());
                }
            }
            FieldLayout::Legacy => {
                fields.insert("csr".into(), csr_pem.into());
                fields.insert("domain".into(), request.domain.clone().into());
                if let Some(service) = request.service_tag() {
                    fields.insert("service".into(), service.into());
                }
                fields.insert("validityDays".into(), request.validity_days.into());
                fields.insert(
                    "certificateType".into(),
                    request.certificate_type.as_str().into(),
                );
                fields.insert("requestedBy".into(), self.requested_by.clone().into());
            }
        }

        fields
    }

    fn evaluate(
        &self,
        sequence: usize,
        candidate: &EndpointCandidate,
        encoding: PayloadEncoding,
        csr_pem: &str,
        result: Result<CaResponse, reqwest::Error>,
    ) -> (AttemptRecord, Option<IssuedCertificate>) {
        let mut record = AttemptRecord {
            sequence,
            endpoint: candidate.path.clone(),
            encoding,
            status: None,
            outcome: AttemptOutcome::NoCertificate,
            response_excerpt: None,
            ca_message: None,
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                record.outcome = AttemptOutcome::Transport(describe_transport_error(&e));
                return (record, None);
            }
        };

        record.status = Some(response.status);
        record.response_excerpt = AttemptRecord::excerpt(&response.body);
        debug!(
            endpoint = %candidate.path,
            status = response.status,
            body = ?record.response_excerpt,
            "CA response"
        );

        let Some(body) = response.json() else {
            return (record, None);
        };

        let metadata = ResponseMetadata::from_body(&body);
        record.ca_message = metadata.message();
        for warning in &metadata.warnings {
            warn!("CA warning: {}", warning);
        }
        if let Some(ref output) = metadata.output {
            debug!("CA output: {}", output);
        }

        let Some((strategy, certificate_pem)) = extract_certificate(&body) else {
            return (record, None);
        };
        if metadata.success == Some(false) {
            warn!("CA reported success=false but returned a certificate; accepting it");
        }
        debug!(?strategy, "Extracted certificate");

        let mut issued = IssuedCertificate::new(
            certificate_pem,
            CertificateSource::Ca {
                endpoint: candidate.path.clone(),
                encoding,
            },
        );

        if let Some(key_pem) = extract_private_key(&body) {
            match key_material_from_pem(key_pem) {
                Ok(key) => {
                    info!("CA returned its own private key; it will be installed instead of the local key");
                    issued = issued.with_issuer_key(key);
                }
                Err(e) => warn!("Ignoring unparseable private key from CA: {}", e),
            }
        }

        if let Err(reason) = usable_with_key(&issued, csr_pem) {
            record.outcome = AttemptOutcome::UnusableCertificate(reason);
            return (record, None);
        }

        record.outcome = AttemptOutcome::Issued;
        (record, Some(issued))
    }
}

/// The certificate belongs to the returned key, or to the CSR's key when none came back
fn usable_with_key(issued: &IssuedCertificate, csr_pem: &str) -> Result<(), String> {
    let matches = match issued.issuer_key {
        Some(ref key) => public_key_matches(&issued.certificate_pem, key.private_key_pem()),
        None => certificate_matches_csr(&issued.certificate_pem, csr_pem),
    };

    match matches {
        Ok(true) => Ok(()),
        Ok(false) if issued.issuer_key.is_some() => {
            Err("certificate does not match the key returned with it".to_string())
        }
        Ok(false) => Err("certificate was issued for a different key".to_string()),
        Err(CertError::CsrGen(e)) => {
            warn!("Cannot compare the certificate with the CSR ({}); leaving it to verification", e);
            Ok(())
        }
        Err(e) => Err(e.to_string()),
    }
}

fn csr_part(request: &CertificateRequest, csr_pem: &str) -> Result<Part, reqwest::Error> {
    Part::text(csr_pem.to_string())
        .file_name(format!("{}.csr", request.domain))
        .mime_str("application/pkcs10")
}

fn form_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn describe_attempt(record: &AttemptRecord) -> String {
    match (&record.outcome, record.status, &record.ca_message) {
        (AttemptOutcome::Transport(reason), _, _) => reason.clone(),
        (AttemptOutcome::UnusableCertificate(reason), Some(status), _) => {
            format!("HTTP {}: {}", status, reason)
        }
        (_, Some(status), Some(message)) => format!("HTTP {}: {}", status, message),
        (_, Some(status), None) => format!("HTTP {}", status),
        _ => "no response".to_string(),
    }
}
