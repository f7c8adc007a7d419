//! Provisioning lock.
//!
//! Shim creation and removal happen under an exclusive `flock(2)` on a lock
//! file, so two installer runs on the same host cannot interleave a delete
//! with a create. The lock is released when the [`ProvisionGuard`] drops or
//! the process exits.

use crate::error::{Result, ShimError};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Interval between attempts to take a contended lock.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Proof that the provisioning lock is held.
#[derive(Debug)]
pub struct ProvisionGuard {
    file: File,
    path: PathBuf,
}

impl ProvisionGuard {
    /// Take the lock at `path`, waiting up to `wait` for a concurrent holder.
    pub async fn acquire(path: &Path, wait: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ShimError::Io { path: parent.to_path_buf(), source: e })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ShimError::Io { path: path.to_path_buf(), source: e })?;

        let deadline = Instant::now() + wait;
        loop {
            match try_lock(&file) {
                Ok(()) => {
                    debug!(path = %path.display(), "Provisioning lock acquired");
                    return Ok(Self { file, path: path.to_path_buf() });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(ShimError::Lock {
                            path: path.to_path_buf(),
                            reason: format!(
                                "held by another process for more than {}s",
                                wait.as_secs()
                            ),
                        });
                    }
                    info!(path = %path.display(), "Waiting for provisioning lock");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(ShimError::Lock { path: path.to_path_buf(), reason: e.to_string() })
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProvisionGuard {
    fn drop(&mut self) {
        // SAFETY: the descriptor is owned by `self.file` and still open.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!(path = %self.path.display(), "Provisioning lock released");
    }
}

fn try_lock(file: &File) -> std::io::Result<()> {
    // SAFETY: flock only reads the descriptor, which `file` keeps open.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/lanshim/provision.lock");
        let guard = ProvisionGuard::acquire(&path, Duration::ZERO).await.unwrap();
        assert_eq!(guard.path(), path);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provision.lock");

        let _held = ProvisionGuard::acquire(&path, Duration::ZERO).await.unwrap();
        let err = ProvisionGuard::acquire(&path, Duration::from_millis(250)).await.unwrap_err();
        assert!(matches!(err, ShimError::Lock { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provision.lock");

        let held = ProvisionGuard::acquire(&path, Duration::ZERO).await.unwrap();
        drop(held);
        assert!(ProvisionGuard::acquire(&path, Duration::ZERO).await.is_ok());
    }
}
