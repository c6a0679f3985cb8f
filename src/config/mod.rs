//! Configuration management
//!
//! This module provides YAML-based configuration management with support for:
//! - Environment variable overrides
//! - Multiple configuration file locations
//! - Default values for all settings
//! - The service roster renewed on schedule

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::{CertificateType, EndpointCandidate, RosterEntry};
use crate::utils::validation::{validate_domain, validate_key_size, validate_site_name};

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub ca: CaConfig,
    /// Distinguished name template for CSRs
    #[serde(default)]
    pub subject: SubjectConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub renewal: RenewalConfig,
    /// Services renewed on schedule
    #[serde(default)]
    pub roster: Vec<RosterEntry>,
    #[serde(default)]
    pub tailscale: TailscaleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Parent directory for per-invocation scratch directories (system temp when unset)
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Directory holding per-domain lock files
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/var/lock/fleet-certs")
}

/// Internal CA connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaConfig {
    #[serde(default = "default_ca_host")]
    pub host: String,
    /// Full base URL; takes precedence over host/port/scheme
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Talk plaintext HTTP to `http_port` instead of TLS
    #[serde(default)]
    pub use_http: bool,
    /// Explicit port override
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Verify the CA's TLS certificate (internal CAs usually serve a self-issued one)
    #[serde(default)]
    pub ssl_verify: bool,
    /// Extra root certificate (PEM) trusted for the CA connection
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
    #[serde(default)]
    pub ca_password: Option<String>,
    #[serde(default = "default_requested_by")]
    pub requested_by: String,
    /// Ordered endpoint catalog; built-in catalog when empty
    #[serde(default)]
    pub endpoints: Vec<EndpointCandidate>,
    /// Paths probed by the health monitor
    #[serde(default = "default_health_paths")]
    pub health_paths: Vec<String>,
    /// GET each candidate before submitting to it (logged only)
    #[serde(default = "default_true")]
    pub probe_before_submit: bool,
    /// Subject used for the health monitor's trial request
    #[serde(default = "default_trial_domain")]
    pub trial_domain: String,
}

fn default_ca_host() -> String {
    "ca.internal".to_string()
}

fn default_https_port() -> u16 {
    443
}

fn default_http_port() -> u16 {
    3000
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_timeout() -> u64 {
    60
}

fn default_requested_by() -> String {
    "fleet-certs".to_string()
}

fn default_health_paths() -> Vec<String> {
    [
        "/",
        "/api/health",
        "/api/generate-cert",
        "/api/certificates/request",
        "/api/cert/request",
        "/api/sign",
        "/api/csr/sign",
        "/certificates/sign",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

fn default_true() -> bool {
    true
}

fn default_trial_domain() -> String {
    "test.local".to_string()
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            host: default_ca_host(),
            url: None,
            https_port: default_https_port(),
            http_port: default_http_port(),
            use_http: false,
            port: None,
            connect_timeout_secs: default_connect_timeout(),
            timeout_secs: default_timeout(),
            ssl_verify: false,
            ca_bundle: None,
            ca_password: None,
            requested_by: default_requested_by(),
            endpoints: Vec::new(),
            health_paths: default_health_paths(),
            probe_before_submit: true,
            trial_domain: default_trial_domain(),
        }
    }
}

impl CaConfig {
    /// Base URL every CA path is joined onto (no trailing slash)
    pub fn base_url(&self) -> String {
        if let Some(ref url) = self.url {
            return url.trim_end_matches('/').to_string();
        }

        let (scheme, default_port) = if self.use_http {
            ("http", self.http_port)
        } else {
            ("https", self.https_port)
        };
        let port = self.port.unwrap_or(default_port);

        match (scheme, port) {
            ("https", 443) | ("http", 80) => format!("{}://{}", scheme, self.host),
            _ => format!("{}://{}:{}", scheme, self.host, port),
        }
    }
}

/// Fixed distinguished-name fields placed on every CSR
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SubjectConfig {
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default = "default_locality")]
    pub locality: String,
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default = "default_organizational_unit")]
    pub organizational_unit: String,
}

fn default_country() -> String {
    "US".to_string()
}

fn default_state() -> String {
    "State".to_string()
}

fn default_locality() -> String {
    "City".to_string()
}

fn default_organization() -> String {
    "Internal Services".to_string()
}

fn default_organizational_unit() -> String {
    "Infrastructure".to_string()
}

impl Default for SubjectConfig {
    fn default() -> Self {
        Self {
            country: default_country(),
            state: default_state(),
            locality: default_locality(),
            organization: default_organization(),
            organizational_unit: default_organizational_unit(),
        }
    }
}

/// One certificate store the installer replicates into
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CertificateStore {
    pub name: String,
    pub cert_dir: PathBuf,
    pub key_dir: PathBuf,
    /// The reverse proxy reads its certificate from this store
    #[serde(default)]
    pub proxy: bool,
}

/// Installation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstallConfig {
    #[serde(default = "default_stores")]
    pub stores: Vec<CertificateStore>,
    #[serde(default)]
    pub owner_uid: u32,
    #[serde(default)]
    pub owner_gid: u32,
    /// chown installed files (only effective when running as root)
    #[serde(default = "default_true")]
    pub enforce_ownership: bool,
}

fn default_stores() -> Vec<CertificateStore> {
    vec![
        CertificateStore {
            name: "system".to_string(),
            cert_dir: PathBuf::from("/etc/ssl/certs"),
            key_dir: PathBuf::from("/etc/ssl/private"),
            proxy: false,
        },
        CertificateStore {
            name: "nginx".to_string(),
            cert_dir: PathBuf::from("/etc/nginx/ssl"),
            key_dir: PathBuf::from("/etc/nginx/ssl"),
            proxy: true,
        },
    ]
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            stores: default_stores(),
            owner_uid: 0,
            owner_gid: 0,
            enforce_ownership: true,
        }
    }
}

/// Reverse proxy (nginx) settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_proxy_binary")]
    pub binary: PathBuf,
    /// Arguments for the dry-run configuration test
    #[serde(default = "default_test_args")]
    pub test_args: Vec<String>,
    /// Program and arguments that reload the proxy
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
    #[serde(default = "default_sites_available")]
    pub sites_available: PathBuf,
    #[serde(default = "default_sites_enabled")]
    pub sites_enabled: PathBuf,
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
    #[serde(default = "default_proxy_io_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_proxy_io_timeout")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_proxy_binary() -> PathBuf {
    PathBuf::from("/usr/sbin/nginx")
}

fn default_test_args() -> Vec<String> {
    vec!["-t".to_string()]
}

fn default_reload_command() -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "reload".to_string(),
        "nginx".to_string(),
    ]
}

fn default_sites_available() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-available")
}

fn default_sites_enabled() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-enabled")
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_io_timeout() -> u64 {
    3600
}

fn default_command_timeout() -> u64 {
    60
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_proxy_binary(),
            test_args: default_test_args(),
            reload_command: default_reload_command(),
            sites_available: default_sites_available(),
            sites_enabled: default_sites_enabled(),
            upstream_host: default_upstream_host(),
            read_timeout_secs: default_proxy_io_timeout(),
            send_timeout_secs: default_proxy_io_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// Where certificates come from
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IssuanceSource {
    #[default]
    Ca,
    SelfSigned,
    Tailscale,
}

/// Scheduled renewal settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenewalConfig {
    /// Cron expression (seconds field first)
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Identity renewed alongside the roster (e.g. a wildcard)
    #[serde(default)]
    pub main_identity: Option<String>,
    #[serde(default)]
    pub source: IssuanceSource,
    /// Issue a self-signed certificate when CA negotiation is exhausted
    #[serde(default)]
    pub fallback_to_self_signed: bool,
    /// Upper bound on waiting for an operator during manual fallback
    #[serde(default = "default_manual_wait")]
    pub manual_wait_secs: u64,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
    #[serde(default = "default_key_size")]
    pub key_size: u32,
    #[serde(default)]
    pub certificate_type: CertificateType,
}

fn default_schedule() -> String {
    "0 0 3 * * SUN".to_string()
}

fn default_manual_wait() -> u64 {
    900
}

fn default_validity_days() -> u32 {
    crate::models::DEFAULT_VALIDITY_DAYS
}

fn default_key_size() -> u32 {
    crate::models::DEFAULT_KEY_SIZE
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            main_identity: None,
            source: IssuanceSource::default(),
            fallback_to_self_signed: false,
            manual_wait_secs: default_manual_wait(),
            validity_days: default_validity_days(),
            key_size: default_key_size(),
            certificate_type: CertificateType::default(),
        }
    }
}

/// Tailscale certificate source settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TailscaleConfig {
    #[serde(default = "default_tailscale_binary")]
    pub binary: PathBuf,
    #[serde(default = "default_tailscale_timeout")]
    pub timeout_secs: u64,
}

fn default_tailscale_binary() -> PathBuf {
    PathBuf::from("tailscale")
}

fn default_tailscale_timeout() -> u64 {
    120
}

impl Default for TailscaleConfig {
    fn default() -> Self {
        Self {
            binary: default_tailscale_binary(),
            timeout_secs: default_tailscale_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Log output target (console or file)
    #[serde(default)]
    pub target: LogTarget,
    /// Directory for log files (used when target is "file")
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Log file name prefix; each binary substitutes its own name when unset
    #[serde(default)]
    pub log_prefix: Option<String>,
    /// Rotate daily instead of appending to one file
    #[serde(default)]
    pub daily_rotation: bool,
}

/// Log output target
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Log to stderr - default for interactive use
    #[default]
    Console,
    /// Log to an append-only file
    File,
    /// Log to both console and file
    Both,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/fleet-certs")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            target: LogTarget::default(),
            log_dir: default_log_dir(),
            log_prefix: None,
            daily_rotation: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the standard locations
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, preferring an explicit path over the search list
    pub fn load_from(explicit: Option<&Path>) -> Result<Self> {
        // Try to load .env file if it exists
        let _ = dotenvy::dotenv();

        let config_path = match explicit {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {:?}", path);
                }
                Some(path.to_path_buf())
            }
            None => std::env::var("FLEET_CERTS_CONFIG")
                .map(PathBuf::from)
                .ok()
                .filter(|p| p.exists())
                .or_else(Self::find_config_file),
        };

        let mut config = match config_path {
            Some(ref path) => Self::from_file(path)?,
            None => AppConfig::default(),
        };

        // Apply environment variable overrides
        config.apply_env_overrides();

        config.validate()?;

        Ok(config)
    }

    /// Parse one YAML file without applying overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_norway::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Find the configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            // Current directory
            PathBuf::from("fleet-certs.yaml"),
            PathBuf::from("config/fleet-certs.yaml"),
            // System config directory
            PathBuf::from("/etc/fleet-certs/config.yaml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("fleet-certs/config.yaml"))
                .unwrap_or_default(),
        ];

        paths.into_iter().find(|p| p.is_file())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // CA overrides
        if let Ok(host) = std::env::var("FLEET_CERTS_CA_HOST") {
            self.ca.host = host;
        }
        if let Ok(url) = std::env::var("FLEET_CERTS_CA_URL") {
            self.ca.url = Some(url);
        }
        if let Ok(port) = std::env::var("FLEET_CERTS_CA_PORT") {
            if let Ok(p) = port.parse() {
                self.ca.port = Some(p);
            }
        }
        if let Ok(password) = std::env::var("FLEET_CERTS_CA_PASSWORD") {
            self.ca.ca_password = Some(password);
        }

        // Logging overrides
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("FLEET_CERTS_LOG_FORMAT") {
            self.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "compact" => LogFormat::Compact,
                _ => LogFormat::Pretty,
            };
        }

        if let Ok(dir) = std::env::var("FLEET_CERTS_LOCK_DIR") {
            self.lock_dir = PathBuf::from(dir);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ca.host.trim().is_empty() && self.ca.url.is_none() {
            anyhow::bail!("CA host cannot be empty");
        }

        if self.ca.connect_timeout_secs == 0 || self.ca.timeout_secs == 0 {
            anyhow::bail!("CA timeouts must be greater than 0");
        }

        if self.install.stores.is_empty() {
            anyhow::bail!("At least one certificate store must be configured");
        }

        if self.proxy.enabled && self.proxy.reload_command.is_empty() {
            anyhow::bail!("Reverse proxy reload command cannot be empty");
        }

        if !validate_key_size(self.renewal.key_size) {
            anyhow::bail!(
                "Unsupported renewal key size {} (expected 2048, 3072 or 4096)",
                self.renewal.key_size
            );
        }

        if let Some(ref identity) = self.renewal.main_identity {
            if !validate_domain(identity) {
                anyhow::bail!("Invalid main identity domain: {}", identity);
            }
        }

        for entry in &self.roster {
            if !validate_domain(&entry.domain) {
                anyhow::bail!("Invalid roster domain: {}", entry.domain);
            }
            if !validate_site_name(&entry.site) {
                anyhow::bail!("Invalid site name for {}: {}", entry.domain, entry.site);
            }
            if entry.port == 0 {
                anyhow::bail!("Roster port for {} cannot be 0", entry.domain);
            }
        }

        crate::services::renewal::validate_cron_expression(&self.renewal.schedule)
            .map_err(|e| anyhow::anyhow!("Invalid renewal schedule: {}", e))?;

        if let Some(ref bundle) = self.ca.ca_bundle {
            if !bundle.exists() {
                tracing::warn!("CA bundle does not exist: {:?}", bundle);
            }
        }

        Ok(())
    }

    /// Roster entry for a domain, if it is a scheduled service
    pub fn roster_entry(&self, domain: &str) -> Option<&RosterEntry> {
        self.roster.iter().find(|e| e.domain == domain)
    }
}
