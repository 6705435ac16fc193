//! Post-sync snapshots of the kernel set and filter rules.
//!
//! Snapshots land next to the config file as `ipset_<blocklist>.bak` and
//! `iptables_<blocklist>.bak`. A failed snapshot never fails a sync.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::config::derive_blocklist_name;
use crate::enforcer::FirewallBackend;
use crate::fs_abstraction::{write_private, FileSystem};

/// Receives a backup request after a successful apply.
#[async_trait]
pub trait BackupSink: Send + Sync {
    /// Returns whether every requested snapshot was written. Advisory only.
    async fn trigger_backup(
        &self,
        config_path: &Path,
        include_set: bool,
        include_rules: bool,
    ) -> bool;
}

/// Writes backend dumps through a [`FileSystem`].
pub struct SnapshotBackup<'a> {
    backend: &'a dyn FirewallBackend,
    fs: &'a dyn FileSystem,
}

impl<'a> SnapshotBackup<'a> {
    pub fn new(backend: &'a dyn FirewallBackend, fs: &'a dyn FileSystem) -> Self {
        Self { backend, fs }
    }
}

/// Snapshot paths for a config: `(set, rules)`.
pub fn backup_paths(config_path: &Path) -> (PathBuf, PathBuf) {
    let blocklist = derive_blocklist_name(&config_path.to_string_lossy());
    let dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    (
        dir.join(format!("ipset_{}.bak", blocklist)),
        dir.join(format!("iptables_{}.bak", blocklist)),
    )
}

impl SnapshotBackup<'_> {
    async fn snapshot_set(&self, set: &str, path: &Path) -> bool {
        let dump = match self.backend.save_set(set).await {
            Ok(dump) => dump,
            Err(e) => {
                error!("Set backup of {} failed: {:#}", set, e);
                return false;
            }
        };
        self.write(path, &dump)
    }

    async fn snapshot_rules(&self, path: &Path) -> bool {
        let dump = match self.backend.save_rules().await {
            Ok(dump) => dump,
            Err(e) => {
                error!("Rule backup failed: {:#}", e);
                return false;
            }
        };
        self.write(path, &dump)
    }

    fn write(&self, path: &Path, dump: &str) -> bool {
        match write_private(self.fs, path, dump.as_bytes()) {
            Ok(()) => {
                info!("Backup written to {}", path.display());
                true
            }
            Err(e) => {
                error!("Failed to write backup {}: {}", path.display(), e);
                false
            }
        }
    }
}

#[async_trait]
impl<'a> BackupSink for SnapshotBackup<'a> {
    async fn trigger_backup(
        &self,
        config_path: &Path,
        include_set: bool,
        include_rules: bool,
    ) -> bool {
        let set = derive_blocklist_name(&config_path.to_string_lossy());
        let (set_path, rules_path) = backup_paths(config_path);

        let mut ok = true;
        if include_set {
            ok &= self.snapshot_set(&set, &set_path).await;
        }
        if include_rules {
            ok &= self.snapshot_rules(&rules_path).await;
        }
        ok
    }
}
