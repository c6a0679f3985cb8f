//! CA negotiation, probing and health models

use std::fmt;

use serde::{Deserialize, Serialize};

/// Longest response body kept on an attempt record
pub const RESPONSE_EXCERPT_LIMIT: usize = 512;

/// How a certificate request body is encoded
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadEncoding {
    Json,
    Multipart,
    FormUrlEncoded,
}

impl PayloadEncoding {
    /// Order encodings are tried in for a candidate that accepts all of them
    pub const ALL: [PayloadEncoding; 3] = [
        PayloadEncoding::Json,
        PayloadEncoding::Multipart,
        PayloadEncoding::FormUrlEncoded,
    ];

    pub fn content_type(&self) -> &'static str {
        match self {
            PayloadEncoding::Json => "application/json",
            PayloadEncoding::Multipart => "multipart/form-data",
            PayloadEncoding::FormUrlEncoded => "application/x-www-form-urlencoded",
        }
    }
}

impl fmt::Display for PayloadEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PayloadEncoding::Json => "json",
            PayloadEncoding::Multipart => "multipart",
            PayloadEncoding::FormUrlEncoded => "form-urlencoded",
        })
    }
}

/// Which request fields an endpoint expects
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldLayout {
    /// The CA generates the key; request carries names and options only
    #[default]
    Canonical,
    /// The CA signs a CSR we submit
    Legacy,
}

/// HTTP method used to submit to an endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubmitMethod {
    #[default]
    Post,
    Put,
}

impl fmt::Display for SubmitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubmitMethod::Post => "POST",
            SubmitMethod::Put => "PUT",
        })
    }
}

/// A CA endpoint the negotiator may submit to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointCandidate {
    /// Path relative to the CA base URL
    pub path: String,
    #[serde(default)]
    pub method: SubmitMethod,
    #[serde(default)]
    pub layout: FieldLayout,
    /// Encodings to try, in order
    #[serde(default = "default_encodings")]
    pub encodings: Vec<PayloadEncoding>,
}

fn default_encodings() -> Vec<PayloadEncoding> {
    PayloadEncoding::ALL.to_vec()
}

impl EndpointCandidate {
    pub fn canonical(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: SubmitMethod::Post,
            layout: FieldLayout::Canonical,
            encodings: default_encodings(),
        }
    }

    pub fn legacy(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: SubmitMethod::Post,
            layout: FieldLayout::Legacy,
            encodings: default_encodings(),
        }
    }

    pub fn with_encodings(mut self, encodings: Vec<PayloadEncoding>) -> Self {
        self.encodings = encodings;
        self
    }
}

/// Classification of a single probe request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Reachable200,
    MethodNotAllowed405,
    NotFound404,
    ServerError5xx(u16),
    Unexpected(u16),
    ConnectionFailed(String),
}

impl ProbeOutcome {
    pub fn from_status(status: u16) -> Self {
        match status {
            200 => ProbeOutcome::Reachable200,
            404 => ProbeOutcome::NotFound404,
            405 => ProbeOutcome::MethodNotAllowed405,
            500..=599 => ProbeOutcome::ServerError5xx(status),
            other => ProbeOutcome::Unexpected(other),
        }
    }

    /// Whether anything answered at all
    pub fn is_connected(&self) -> bool {
        !matches!(self, ProbeOutcome::ConnectionFailed(_))
    }

    /// 200 or 405 means the path is served (405 for POST-only endpoints)
    pub fn endpoint_exists(&self) -> bool {
        matches!(
            self,
            ProbeOutcome::Reachable200 | ProbeOutcome::MethodNotAllowed405
        )
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Reachable200 => write!(f, "200 reachable"),
            ProbeOutcome::MethodNotAllowed405 => write!(f, "405 method not allowed"),
            ProbeOutcome::NotFound404 => write!(f, "404 not found"),
            ProbeOutcome::ServerError5xx(code) => write!(f, "{} server error", code),
            ProbeOutcome::Unexpected(code) => write!(f, "{} unexpected", code),
            ProbeOutcome::ConnectionFailed(reason) => write!(f, "connection failed: {}", reason),
        }
    }
}

/// Result of one submission attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// A certificate was extracted from the response
    Issued,
    /// The CA answered but no certificate could be extracted
    NoCertificate,
    /// A certificate came back that does not belong to the submitted or returned key
    UnusableCertificate(String),
    /// The request never produced an HTTP response
    Transport(String),
}

/// One entry of the negotiation log
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// 1-based position in the attempt sequence
    pub sequence: usize,
    pub endpoint: String,
    pub encoding: PayloadEncoding,
    pub status: Option<u16>,
    pub outcome: AttemptOutcome,
    /// First bytes of the response body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_excerpt: Option<String>,
    /// `error` or `details` reported by the CA
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_message: Option<String>,
}

impl AttemptRecord {
    /// Cut a response body down to the excerpt limit on a char boundary
    pub fn excerpt(body: &str) -> Option<String> {
        let body = body.trim();
        if body.is_empty() {
            return None;
        }
        if body.len() <= RESPONSE_EXCERPT_LIMIT {
            return Some(body.to_string());
        }

        let mut end = RESPONSE_EXCERPT_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        Some(format!("{}...", &body[..end]))
    }
}

/// Overall CA health
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HealthClassification {
    /// Root reachable and a trial request returned a certificate
    Healthy,
    /// Root reachable, but the trial request did not return a certificate
    NotReady,
    /// Root answered with something other than 200
    Issues,
    /// Root unreachable
    Down,
}

impl HealthClassification {
    pub fn exit_code(&self) -> u8 {
        match self {
            HealthClassification::Healthy => 0,
            HealthClassification::NotReady => 20,
            HealthClassification::Issues => 21,
            HealthClassification::Down => 22,
        }
    }
}

impl fmt::Display for HealthClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthClassification::Healthy => "healthy",
            HealthClassification::NotReady => "not ready",
            HealthClassification::Issues => "issues",
            HealthClassification::Down => "down",
        })
    }
}

/// Probe result for one path
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub path: String,
    pub outcome: ProbeOutcome,
}

/// Full health check result
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub base_url: String,
    pub classification: HealthClassification,
    pub root: ProbeOutcome,
    /// Status of every known endpoint
    pub endpoints: Vec<EndpointStatus>,
    /// Trial negotiation attempts (empty when the root was not reachable)
    pub trial_attempts: Vec<AttemptRecord>,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}
