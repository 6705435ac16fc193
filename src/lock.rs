//! Per-blocklist advisory locking.
//!
//! Two overlapping runs against the same blocklist (a scheduler tick and
//! a manual run) would race on the kernel set and on the config file.
//! A sync holds an exclusive flock on `<lock_dir>/<blocklist>.lock` from
//! set bootstrap until the backup has been triggered.

use anyhow::Context;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::SyncError;

/// Default directory for lock files.
pub const DEFAULT_LOCK_DIR: &str = "/run/blocksync";

/// Exclusive lock on one blocklist, released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Take the lock without blocking; fails if another run holds it.
    pub fn acquire(lock_dir: &Path, blocklist: &str) -> Result<Self, SyncError> {
        let path = lock_dir.join(format!("{}.lock", blocklist));
        let file = open_lock_file(lock_dir, &path).map_err(|e| SyncError::Lock(format!("{:#}", e)))?;

        file.try_lock_exclusive().map_err(|_| {
            SyncError::Lock(format!(
                "another sync for {} is already running (lock file: {})",
                blocklist,
                path.display()
            ))
        })?;

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open or create without truncating, so there is no window between
/// creation and locking.
fn open_lock_file(lock_dir: &Path, path: &Path) -> anyhow::Result<File> {
    fs::create_dir_all(lock_dir)
        .with_context(|| format!("Failed to create lock directory {}", lock_dir.display()))?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))?;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .context("Failed to set lock file permissions")?;

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let guard = LockGuard::acquire(dir.path(), "blocklist_acme").unwrap();
        assert!(guard.path().ends_with("blocklist_acme.lock"));

        let second = LockGuard::acquire(dir.path(), "blocklist_acme");
        assert!(matches!(second, Err(SyncError::Lock(_))));
    }

    #[test]
    fn test_released_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _guard = LockGuard::acquire(dir.path(), "blocklist_acme").unwrap();
        }
        assert!(LockGuard::acquire(dir.path(), "blocklist_acme").is_ok());
    }

    #[test]
    fn test_locks_are_scoped_per_blocklist() {
        let dir = TempDir::new().unwrap();
        let _a = LockGuard::acquire(dir.path(), "blocklist_a").unwrap();
        assert!(LockGuard::acquire(dir.path(), "blocklist_b").is_ok());
    }

    #[test]
    fn test_creates_lock_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("run/blocksync");
        let guard = LockGuard::acquire(&nested, "blocklist_acme").unwrap();
        let mode = fs::metadata(guard.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
