//! HTTP client for the internal certificate authority

use std::time::Duration;

use reqwest::{multipart::Form, Client, Method, RequestBuilder};
use tracing::debug;

use crate::config::CaConfig;
use crate::models::SubmitMethod;
use crate::utils::error::{CertError, CertResult};

/// Status and raw body of one CA response
#[derive(Debug, Clone)]
pub struct CaResponse {
    pub status: u16,
    pub body: String,
}

impl CaResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body parsed as JSON, if it is JSON
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/// Client for the internal CA's HTTP API
///
/// Transport failures are returned as [`reqwest::Error`] so callers can tell
/// "nothing answered" apart from "answered with an error status".
#[derive(Clone)]
pub struct CaClient {
    client: Client,
    base_url: String,
}

impl CaClient {
    /// Create a new CA client from configuration
    pub fn new(config: &CaConfig) -> CertResult<Self> {
        let mut client_builder = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("fleet-certs/", env!("CARGO_PKG_VERSION")));

        // Add CA certificate if provided
        if let Some(ca_path) = &config.ca_bundle {
            let ca_pem = std::fs::read(ca_path)
                .map_err(|e| CertError::Config(format!("Failed to read CA bundle: {}", e)))?;
            let ca_cert = reqwest::Certificate::from_pem(&ca_pem).map_err(|e| {
                CertError::Config(format!("Failed to parse CA certificate: {}", e))
            })?;
            client_builder = client_builder.add_root_certificate(ca_cert);
        }

        // Internal CAs usually serve a certificate they issued themselves
        if !config.ssl_verify {
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        let client = client_builder
            .build()
            .map_err(|e| CertError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url(),
        })
    }

    /// Point the client at a different base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a CA path
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// GET a path
    pub async fn get(&self, path: &str) -> Result<CaResponse, reqwest::Error> {
        let request = self.client.get(self.url_for(path));
        Self::execute(request).await
    }

    /// Submit a JSON body
    pub async fn submit_json(
        &self,
        method: SubmitMethod,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<CaResponse, reqwest::Error> {
        let request = self.request(method, path).json(body);
        Self::execute(request).await
    }

    /// Submit a multipart form
    pub async fn submit_multipart(
        &self,
        method: SubmitMethod,
        path: &str,
        form: Form,
    ) -> Result<CaResponse, reqwest::Error> {
        let request = self.request(method, path).multipart(form);
        Self::execute(request).await
    }

    /// Submit a URL-encoded form
    pub async fn submit_form(
        &self,
        method: SubmitMethod,
        path: &str,
        fields: &[(&str, String)],
    ) -> Result<CaResponse, reqwest::Error> {
        let request = self.request(method, path).form(fields);
        Self::execute(request).await
    }

    fn request(&self, method: SubmitMethod, path: &str) -> RequestBuilder {
        let method = match method {
            SubmitMethod::Post => Method::POST,
            SubmitMethod::Put => Method::PUT,
        };
        self.client.request(method, self.url_for(path))
    }

    async fn execute(request: RequestBuilder) -> Result<CaResponse, reqwest::Error> {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!(status, bytes = body.len(), "CA responded");

        Ok(CaResponse { status, body })
    }
}
