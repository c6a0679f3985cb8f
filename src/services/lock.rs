//! Per-domain advisory lock files

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::utils::error::{CertError, CertResult};
use crate::utils::validation::file_stem_for_domain;

/// Attempts before giving up on a lock file that keeps being replaced
const ACQUIRE_ATTEMPTS: usize = 3;

/// Exclusive claim on one domain's generate/verify/install sequence
///
/// Held through `flock` on the lock file, so the kernel releases it when the
/// owner exits. The file records the owner's PID for diagnostics and is removed
/// on drop.
#[derive(Debug)]
pub struct DomainLock {
    path: PathBuf,
    file: File,
}

impl DomainLock {
    pub fn lock_path(lock_dir: &Path, domain: &str) -> PathBuf {
        lock_dir.join(format!("{}.lock", file_stem_for_domain(domain)))
    }

    pub fn acquire(lock_dir: &Path, domain: &str) -> CertResult<Self> {
        std::fs::create_dir_all(lock_dir)?;
        let path = Self::lock_path(lock_dir, domain);

        for _ in 0..ACQUIRE_ATTEMPTS {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            if !try_lock_exclusive(&file)? {
                return Err(CertError::LockHeld(match read_holder(&path) {
                    Some(pid) => format!("{} is being renewed by PID {} ({:?})", domain, pid, path),
                    None => format!("{} is being renewed ({:?})", domain, path),
                }));
            }

            // A previous holder may have unlinked the file between our open and lock
            if !still_linked(&file, &path) {
                debug!("Lock file {:?} was replaced, retrying", path);
                continue;
            }

            return Self::claim(path, file);
        }

        Err(CertError::LockHeld(format!(
            "{} ({:?}) kept changing while acquiring",
            domain, path
        )))
    }

    fn claim(path: PathBuf, mut file: File) -> CertResult<Self> {
        if let Some(pid) = read_holder(&path) {
            warn!("Reclaiming lock {:?} left by PID {}", path, pid);
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!("Acquired lock {:?}", path);
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DomainLock {
    fn drop(&mut self) {
        // Unlink while still holding the lock; the flock goes with the descriptor
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release lock {:?}: {}", self.path, e);
        }
        debug!("Released lock {:?} (fd {})", self.path, self.file.as_raw_fd());
    }
}

fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    // SAFETY: the descriptor is owned by `file` and stays open for the call
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

fn still_linked(file: &File, path: &Path) -> bool {
    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(open), Ok(on_disk)) => open.dev() == on_disk.dev() && open.ino() == on_disk.ino(),
        _ => false,
    }
}

fn read_holder(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
