//! Replication of verified certificate/key pairs into every certificate store

use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::verifier::certificate_der;
use crate::config::{CertificateStore, InstallConfig};
use crate::models::{InstalledCertificate, KeyMaterial, OutputFormat, StoreReplica};
use crate::utils::error::{CertError, CertResult};
use crate::utils::validation::file_stem_for_domain;

/// Mode for certificate files
pub const CERTIFICATE_MODE: u32 = 0o644;

/// Mode for private key files
pub const KEY_MODE: u32 = 0o600;

/// Writes certificate/key pairs into every configured store
#[derive(Debug, Clone)]
pub struct CertificateInstaller {
    stores: Vec<CertificateStore>,
    owner: Option<(u32, u32)>,
}

impl CertificateInstaller {
    pub fn new(config: &InstallConfig) -> Self {
        Self {
            stores: config.stores.clone(),
            owner: config
                .enforce_ownership
                .then_some((config.owner_uid, config.owner_gid)),
        }
    }

    pub fn stores(&self) -> &[CertificateStore] {
        &self.stores
    }

    /// Install a verified pair
    ///
    /// Every file is written through a temp file in the target directory and renamed
    /// into place. Afterwards all replicas are read back and checked for identical
    /// contents and the expected modes.
    pub fn install(
        &self,
        domain: &str,
        certificate_pem: &str,
        key: &KeyMaterial,
        format: OutputFormat,
    ) -> CertResult<InstalledCertificate> {
        if self.stores.is_empty() {
            return Err(CertError::Install("no certificate stores configured".to_string()));
        }

        let stem = file_stem_for_domain(domain);
        let der = match format {
            OutputFormat::Der => Some(certificate_der(certificate_pem)?),
            OutputFormat::Pem => None,
        };

        let replicas: Vec<StoreReplica> = self
            .stores
            .iter()
            .map(|store| StoreReplica {
                store: store.name.clone(),
                certificate_path: store.cert_dir.join(format!("{}.crt", stem)),
                key_path: store.key_dir.join(format!("{}.key", stem)),
                der_path: der
                    .as_ref()
                    .map(|_| store.cert_dir.join(format!("{}.der", stem))),
                proxy: store.proxy,
            })
            .collect();

        let snapshot = Snapshot::capture(&replicas)?;
        if let Err(e) = self.write_replicas(domain, &replicas, certificate_pem, key, der.as_deref()) {
            warn!("Install of {} failed, restoring previous files: {}", domain, e);
            snapshot.restore(self);
            return Err(e);
        }

        info!(
            "Installed certificate for {} into {} store(s)",
            domain,
            replicas.len()
        );

        Ok(InstalledCertificate {
            domain: domain.to_string(),
            replicas,
        })
    }

    fn write_replicas(
        &self,
        domain: &str,
        replicas: &[StoreReplica],
        certificate_pem: &str,
        key: &KeyMaterial,
        der: Option<&[u8]>,
    ) -> CertResult<()> {
        for replica in replicas {
            self.write_file(
                &replica.certificate_path,
                certificate_pem.as_bytes(),
                CERTIFICATE_MODE,
            )?;
            self.write_file(&replica.key_path, key.private_key_pem().as_bytes(), KEY_MODE)?;
            if let (Some(path), Some(bytes)) = (&replica.der_path, der) {
                self.write_file(path, bytes, CERTIFICATE_MODE)?;
            }

            debug!(
                "Installed {} into store '{}' ({:?})",
                domain, replica.store, replica.certificate_path
            );
        }

        check_replicas(replicas, certificate_pem.as_bytes(), key.private_key_pem().as_bytes())
    }

    fn write_file(&self, target: &Path, contents: &[u8], mode: u32) -> CertResult<()> {
        let dir = target
            .parent()
            .ok_or_else(|| CertError::Install(format!("{:?} has no parent directory", target)))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| CertError::Install(format!("cannot create {:?}: {}", dir, e)))?;

        let mut staged = NamedTempFile::new_in(dir)
            .map_err(|e| CertError::Install(format!("cannot stage file in {:?}: {}", dir, e)))?;
        staged.as_file().set_permissions(Permissions::from_mode(mode))?;
        staged.write_all(contents)?;
        staged.as_file().sync_all()?;

        if let Some((uid, gid)) = self.owner {
            if running_as_root() {
                std::os::unix::fs::chown(staged.path(), Some(uid), Some(gid)).map_err(|e| {
                    CertError::Install(format!("cannot set owner of {:?}: {}", target, e))
                })?;
            }
        }

        staged
            .persist(target)
            .map_err(|e| CertError::Install(format!("cannot replace {:?}: {}", target, e.error)))?;
        Ok(())
    }
}

/// A file an install is about to replace
struct PriorFile {
    path: PathBuf,
    /// Previous contents and mode, `None` when the file did not exist
    previous: Option<(Zeroizing<Vec<u8>>, u32)>,
}

/// Every target of an install as it was before the first write
struct Snapshot {
    files: Vec<PriorFile>,
}

impl Snapshot {
    fn capture(replicas: &[StoreReplica]) -> CertResult<Self> {
        let mut files = Vec::new();
        for replica in replicas {
            let paths = [
                Some(&replica.certificate_path),
                Some(&replica.key_path),
                replica.der_path.as_ref(),
            ];
            for path in paths.into_iter().flatten() {
                files.push(PriorFile {
                    path: path.clone(),
                    previous: read_previous(path)?,
                });
            }
        }
        Ok(Self { files })
    }

    /// Put back previous contents and remove files the install created
    fn restore(&self, installer: &CertificateInstaller) {
        for file in self.files.iter().rev() {
            let result = match &file.previous {
                Some((contents, mode)) => installer.write_file(&file.path, contents, *mode),
                None => match std::fs::remove_file(&file.path) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                    _ => Ok(()),
                },
            };
            if let Err(e) = result {
                warn!("Could not restore {:?}: {}", file.path, e);
            }
        }
    }
}

fn read_previous(path: &Path) -> CertResult<Option<(Zeroizing<Vec<u8>>, u32)>> {
    match std::fs::read(path) {
        Ok(contents) => Ok(Some((Zeroizing::new(contents), mode_of(path)?))),
        Err(_) if !path.exists() => Ok(None),
        Err(e) => Err(CertError::Install(format!("cannot read {:?}: {}", path, e))),
    }
}

fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

/// Every replica holds the expected bytes and the key is stricter than the certificate
fn check_replicas(replicas: &[StoreReplica], certificate: &[u8], key: &[u8]) -> CertResult<()> {
    for replica in replicas {
        expect_contents(&replica.certificate_path, certificate)?;
        expect_contents(&replica.key_path, key)?;

        let cert_mode = mode_of(&replica.certificate_path)?;
        let key_mode = mode_of(&replica.key_path)?;
        if !key_is_stricter(key_mode, cert_mode) {
            return Err(CertError::Install(format!(
                "key {:?} mode {:o} is not stricter than certificate mode {:o}",
                replica.key_path, key_mode, cert_mode
            )));
        }
    }
    Ok(())
}

fn expect_contents(path: &PathBuf, expected: &[u8]) -> CertResult<()> {
    let actual = std::fs::read(path)
        .map_err(|e| CertError::Install(format!("cannot read back {:?}: {}", path, e)))?;
    if actual != expected {
        return Err(CertError::Install(format!(
            "{:?} differs from the verified content",
            path
        )));
    }
    Ok(())
}

fn mode_of(path: &Path) -> CertResult<u32> {
    Ok(std::fs::metadata(path)?.permissions().mode() & 0o777)
}

/// Key grants no group/other access and a strict subset of the certificate's bits
pub fn key_is_stricter(key_mode: u32, cert_mode: u32) -> bool {
    key_mode & 0o077 == 0 && key_mode & !cert_mode == 0 && key_mode != cert_mode
}
