//! Command-line definitions for the `fleet-certs` binary

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::CaConfig;
use crate::models::{
    CertificateRequest, CertificateType, OutputFormat, DEFAULT_KEY_SIZE, DEFAULT_VALIDITY_DAYS,
};

/// Certificate lifecycle for an internal service fleet
#[derive(Parser, Debug)]
#[command(name = "fleet-certs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (overrides the search path and FLEET_CERTS_CONFIG)
    #[arg(short, long, global = true, env = "FLEET_CERTS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Never wait for an operator; manual fallback fails fast
    #[arg(long, global = true)]
    pub non_interactive: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Request a certificate from the CA, install it and configure the proxy
    Request {
        #[command(flatten)]
        request: RequestArgs,

        #[command(flatten)]
        ca: CaArgs,

        /// Self-sign when the CA yields no certificate
        #[arg(long)]
        self_signed_fallback: bool,

        /// Do not reload the reverse proxy
        #[arg(long)]
        no_reload: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Issue a development certificate signed by its own key
    SelfSigned {
        #[command(flatten)]
        request: RequestArgs,

        #[arg(long)]
        no_reload: bool,

        #[arg(long)]
        json: bool,
    },

    /// Obtain a certificate through the local Tailscale daemon
    Tailscale {
        /// Tailnet name of this node
        #[arg(short, long)]
        domain: String,

        /// TLS port for the proxy site
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        no_reload: bool,

        #[arg(long)]
        json: bool,
    },

    /// Generate a private key and CSR without contacting the CA
    Generate {
        #[command(flatten)]
        request: RequestArgs,

        /// Directory for <domain>.key and <domain>.csr
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Submit an existing CSR to the CA
    Submit {
        #[command(flatten)]
        request: RequestArgs,

        #[command(flatten)]
        ca: CaArgs,

        /// CSR file (PEM)
        #[arg(long)]
        csr: PathBuf,

        /// Where the signed certificate is written
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Verify a certificate and private key belong together
    Verify {
        #[arg(long)]
        cert: PathBuf,

        #[arg(long)]
        key: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Verify and install an existing certificate and key
    Install {
        #[arg(long)]
        cert: PathBuf,

        #[arg(long)]
        key: PathBuf,

        #[arg(short, long)]
        domain: String,

        /// TLS port for the proxy site
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(short, long, default_value = "pem")]
        format: OutputFormat,

        /// Mark the proxy site as serving a development certificate
        #[arg(long)]
        development: bool,

        #[arg(long)]
        no_reload: bool,

        #[arg(long)]
        json: bool,
    },

    /// Classify CA paths by the status a GET returns
    Probe {
        /// Paths to probe (defaults to the configured health paths)
        paths: Vec<String>,

        #[command(flatten)]
        ca: CaArgs,
    },

    /// Check CA reachability and readiness to issue
    Health {
        #[command(flatten)]
        ca: CaArgs,

        #[arg(long)]
        json: bool,
    },

    /// Renew every roster entry and the main identity
    Renew {
        /// Print the plan without issuing anything
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,
    },
}

/// What to put in the certificate
#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    /// Domain the certificate is for
    #[arg(short, long)]
    pub domain: String,

    /// TLS port for the proxy site
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Service name, recorded in the OU
    #[arg(short, long)]
    pub service: Option<String>,

    /// server|https|nginx|web|fixed|temp|direct
    #[arg(short = 't', long = "type", default_value = "server")]
    pub certificate_type: CertificateType,

    /// RSA key size in bits
    #[arg(short, long, default_value_t = DEFAULT_KEY_SIZE)]
    pub key_size: u32,

    /// Validity in days
    #[arg(short = 'v', long, visible_alias = "days", default_value_t = DEFAULT_VALIDITY_DAYS)]
    pub validity: u32,

    /// Additional IP address SAN
    #[arg(short, long)]
    pub ip: Option<IpAddr>,

    /// pem|der
    #[arg(short, long, default_value = "pem")]
    pub format: OutputFormat,
}

impl RequestArgs {
    pub fn to_request(&self) -> CertificateRequest {
        let mut request = CertificateRequest::new(self.domain.clone())
            .with_type(self.certificate_type)
            .with_key_size(self.key_size)
            .with_validity_days(self.validity)
            .with_output_format(self.format);

        if let Some(port) = self.port {
            request = request.with_port(port);
        }
        if let Some(ref service) = self.service {
            request = request.with_service(service.clone());
        }
        if let Some(ip) = self.ip {
            request = request.with_ip(ip);
        }
        request
    }
}

/// CA location overrides
#[derive(Args, Debug, Clone, Default)]
pub struct CaArgs {
    /// Use the plaintext port instead of TLS
    #[arg(long)]
    pub http: bool,

    /// CA host
    #[arg(long)]
    pub server: Option<String>,

    /// CA port
    #[arg(long)]
    pub ca_port: Option<u16>,
}

impl CaArgs {
    /// Apply the overrides on top of file and environment settings
    pub fn apply(&self, ca: &mut CaConfig) {
        if self.http {
            ca.use_http = true;
        }
        if let Some(ref server) = self.server {
            ca.host = server.clone();
            ca.url = None;
        }
        if let Some(port) = self.ca_port {
            ca.port = Some(port);
        }
    }
}
