//! Reverse proxy site configuration and control
//!
//! Site files are applied transactionally: the new file is put in place, the proxy's
//! own config test is run, and on failure the previous file (or its absence) is
//! restored before anything is reloaded.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use super::command::run_command;
use crate::config::ProxyConfig;
use crate::models::{RosterEntry, StoreReplica};
use crate::utils::error::{CertError, CertResult};

/// Protocols allowed on generated sites
pub const TLS_PROTOCOLS: &str = "TLSv1.2 TLSv1.3";

/// Cipher allowlist for TLSv1.2 (TLSv1.3 suites are fixed by OpenSSL)
pub const TLS_CIPHERS: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:\
ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305";

/// Response headers added to every generated site
pub const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("Strict-Transport-Security", "max-age=31536000; includeSubDomains"),
    ("X-Content-Type-Options", "nosniff"),
    ("X-Frame-Options", "SAMEORIGIN"),
    ("X-XSS-Protection", "1; mode=block"),
    ("Referrer-Policy", "strict-origin-when-cross-origin"),
];

/// Header marking sites that serve a self-signed certificate
pub const DEVELOPMENT_MARKER_HEADER: &str = "X-Certificate-Source";
pub const DEVELOPMENT_MARKER_VALUE: &str = "self-signed (development only)";

/// Everything a site file is rendered from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteSpec {
    pub site: String,
    pub domain: String,
    pub listen_port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub certificate_path: PathBuf,
    pub key_path: PathBuf,
    /// Adds the development-only marker header
    pub development: bool,
    pub read_timeout_secs: u64,
    pub send_timeout_secs: u64,
}

impl SiteSpec {
    pub fn new(
        entry: &RosterEntry,
        replica: &StoreReplica,
        config: &ProxyConfig,
        development: bool,
    ) -> Self {
        Self {
            site: entry.site.clone(),
            domain: entry.domain.clone(),
            listen_port: entry.port,
            upstream_host: config.upstream_host.clone(),
            upstream_port: entry.upstream_port(),
            certificate_path: replica.certificate_path.clone(),
            key_path: replica.key_path.clone(),
            development,
            read_timeout_secs: config.read_timeout_secs,
            send_timeout_secs: config.send_timeout_secs,
        }
    }
}

/// Render an nginx `server` block for a site
pub fn render_site_config(spec: &SiteSpec) -> String {
    let mut headers = String::new();
    for (name, value) in SECURITY_HEADERS {
        headers.push_str(&format!("    add_header {} \"{}\" always;\n", name, value));
    }
    if spec.development {
        headers.push_str(&format!(
            "    add_header {} \"{}\" always;\n",
            DEVELOPMENT_MARKER_HEADER, DEVELOPMENT_MARKER_VALUE
        ));
    }

    format!(
        r#"# Managed by fleet-certs for {domain}; regenerated on every renewal
server {{
    listen {port} ssl;
    listen [::]:{port} ssl;
    server_name {domain};

    ssl_certificate {cert};
    ssl_certificate_key {key};
    ssl_protocols {protocols};
    ssl_ciphers {ciphers};
    ssl_prefer_server_ciphers off;
    ssl_session_cache shared:SSL:10m;
    ssl_session_timeout 1d;

{headers}
    location / {{
        proxy_pass http://{upstream_host}:{upstream_port};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_read_timeout {read}s;
        proxy_send_timeout {send}s;
        proxy_buffering off;
    }}
}}
"#,
        domain = spec.domain,
        port = spec.listen_port,
        cert = spec.certificate_path.display(),
        key = spec.key_path.display(),
        protocols = TLS_PROTOCOLS,
        ciphers = TLS_CIPHERS,
        headers = headers,
        upstream_host = spec.upstream_host,
        upstream_port = spec.upstream_port,
        read = spec.read_timeout_secs,
        send = spec.send_timeout_secs,
    )
}

/// Control over the running reverse proxy
#[async_trait]
pub trait ProxyController: Send + Sync {
    /// Dry-run test of the full active configuration
    async fn test_config(&self) -> CertResult<()>;

    /// Reload the proxy with its current configuration
    async fn reload(&self) -> CertResult<()>;
}

/// nginx driven through its binary and the service manager
#[derive(Debug, Clone)]
pub struct NginxController {
    binary: PathBuf,
    test_args: Vec<String>,
    reload_command: Vec<String>,
    timeout: Duration,
}

impl NginxController {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            test_args: config.test_args.clone(),
            reload_command: config.reload_command.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }
}

#[async_trait]
impl ProxyController for NginxController {
    async fn test_config(&self) -> CertResult<()> {
        let report = run_command(&self.binary, &self.test_args, self.timeout)
            .await
            .map_err(|e| CertError::ReverseProxyConfigInvalid(e.to_string()))?;

        if report.success {
            Ok(())
        } else {
            Err(CertError::ReverseProxyConfigInvalid(
                report.diagnostics().to_string(),
            ))
        }
    }

    async fn reload(&self) -> CertResult<()> {
        let Some((program, args)) = self.reload_command.split_first() else {
            return Err(CertError::Config("empty reload command".to_string()));
        };

        let report = run_command(Path::new(program), args, self.timeout).await?;
        if report.success {
            info!("Reverse proxy reloaded");
            Ok(())
        } else {
            Err(CertError::Command(format!(
                "reload failed: {}",
                report.diagnostics()
            )))
        }
    }
}

/// Applies site files with validation and rollback
#[derive(Clone)]
pub struct ProxySiteManager {
    sites_available: PathBuf,
    sites_enabled: PathBuf,
    controller: Arc<dyn ProxyController>,
}

impl ProxySiteManager {
    pub fn new(config: &ProxyConfig, controller: Arc<dyn ProxyController>) -> Self {
        Self {
            sites_available: config.sites_available.clone(),
            sites_enabled: config.sites_enabled.clone(),
            controller,
        }
    }

    pub fn controller(&self) -> &Arc<dyn ProxyController> {
        &self.controller
    }

    pub fn site_path(&self, site: &str) -> PathBuf {
        self.sites_available.join(site)
    }

    pub fn enabled_path(&self, site: &str) -> PathBuf {
        self.sites_enabled.join(site)
    }

    /// Put a site in place and keep it only if the proxy accepts the result
    ///
    /// Does not reload; callers batch reloads.
    pub async fn apply_site(&self, spec: &SiteSpec) -> CertResult<PathBuf> {
        let site_path = self.site_path(&spec.site);
        let enabled_path = self.enabled_path(&spec.site);
        let links_separately = self.sites_enabled != self.sites_available;

        let previous = match std::fs::read(&site_path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let link_existed = std::fs::symlink_metadata(&enabled_path).is_ok();

        let rendered = render_site_config(spec);
        write_atomically(&site_path, rendered.as_bytes())?;

        if links_separately && !link_existed {
            std::fs::create_dir_all(&self.sites_enabled)?;
            std::os::unix::fs::symlink(&site_path, &enabled_path)?;
        }

        match self.controller.test_config().await {
            Ok(()) => {
                info!(
                    "Activated site '{}' for {} on port {}",
                    spec.site, spec.domain, spec.listen_port
                );
                Ok(site_path)
            }
            Err(e) => {
                warn!("Site '{}' failed validation; rolling back", spec.site);
                self.rollback(&site_path, &enabled_path, previous, links_separately && !link_existed);
                Err(match e {
                    CertError::ReverseProxyConfigInvalid(_) => e,
                    other => CertError::ReverseProxyConfigInvalid(other.to_string()),
                })
            }
        }
    }

    fn rollback(
        &self,
        site_path: &Path,
        enabled_path: &Path,
        previous: Option<Vec<u8>>,
        remove_link: bool,
    ) {
        let restored = match previous {
            Some(bytes) => write_atomically(site_path, &bytes),
            None => std::fs::remove_file(site_path).map_err(CertError::from),
        };
        if let Err(e) = restored {
            error!("Failed to restore {:?}: {}", site_path, e);
        }

        if remove_link {
            if let Err(e) = std::fs::remove_file(enabled_path) {
                error!("Failed to remove {:?}: {}", enabled_path, e);
            }
        }
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> CertResult<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .ok_or_else(|| CertError::Install(format!("{:?} has no parent directory", path)))?;
    std::fs::create_dir_all(dir)?;

    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(contents)?;
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }
    staged
        .persist(path)
        .map_err(|e| CertError::Install(format!("cannot replace {:?}: {}", path, e.error)))?;
    Ok(())
}
