//! Backup command implementation.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::backup::{backup_paths, BackupSink, SnapshotBackup};
use crate::cmd_abstraction::SystemExecutor;
use crate::config::{resolve_config_path, Backend, Config};
use crate::enforcer::{create_backend, is_root};
use crate::fs_abstraction::real_fs;

/// The set is snapshotted unless only `--rules` was asked for.
fn snapshot_targets(set: bool, rules: bool) -> (bool, bool) {
    (set || !rules, rules)
}

/// Run the backup command
pub async fn run(config_name: &str, config_dir: &Path, set: bool, rules: bool) -> Result<()> {
    if !is_root() {
        println!("You need to be root!");
        return Ok(());
    }

    let (set, rules) = snapshot_targets(set, rules);
    let path = resolve_config_path(config_dir, config_name);
    // Only the backend choice is needed; a missing config means auto-detect.
    let backend_kind = match std::fs::read_to_string(&path) {
        Ok(content) => Config::from_json(&content)?.backend,
        Err(_) => Backend::Auto,
    };

    let backend = create_backend(backend_kind, Arc::new(SystemExecutor::new()))?;
    let sink = SnapshotBackup::new(backend.as_ref(), real_fs());

    if !sink.trigger_backup(&path, set, rules).await {
        anyhow::bail!("Backup failed (see log above)");
    }

    let (set_path, rules_path) = backup_paths(&path);
    if set {
        println!("[OK] {}", set_path.display());
    }
    if rules {
        println!("[OK] {}", rules_path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_targets_default_to_set() {
        assert_eq!(snapshot_targets(false, false), (true, false));
        assert_eq!(snapshot_targets(true, false), (true, false));
        assert_eq!(snapshot_targets(false, true), (false, true));
        assert_eq!(snapshot_targets(true, true), (true, true));
    }
}
