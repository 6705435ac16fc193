//! Fetch command implementation.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::backup::SnapshotBackup;
use crate::cmd_abstraction::SystemExecutor;
use crate::config::{resolve_config_path, ConfigOverrides, ConfigStore, JsonConfigStore, SecureString};
use crate::context::{RunContext, Verbosity};
use crate::enforcer::{create_backend, is_root};
use crate::fetcher::HttpRemote;
use crate::fs_abstraction::real_fs;
use crate::sync::SyncEngine;
use crate::validation::validate_timeout;

/// Options of `blocksync fetch`
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub config: String,
    pub config_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub host: Option<String>,
    pub token: Option<String>,
    pub all: bool,
    pub ignore_cert: bool,
    pub timeout: Option<u64>,
    pub verbosity: u8,
}

/// Run the fetch command
pub async fn run(opts: FetchOptions) -> Result<()> {
    if !is_root() {
        println!("You need to be root!");
        return Ok(());
    }

    if let Some(secs) = opts.timeout {
        validate_timeout(secs)?;
    }

    let path = resolve_config_path(&opts.config_dir, &opts.config);
    let overrides = ConfigOverrides {
        host: opts.host.clone(),
        token: opts.token.clone().map(SecureString::from),
        ..Default::default()
    }
    .with_env_token();
    let store = JsonConfigStore::new(&path).with_overrides(overrides);

    // Backend choice and timeout come from the config; the engine reloads it.
    let config = store.load()?;
    let timeout = opts
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.request_timeout());
    debug!("Using {} with a {}s timeout", path.display(), timeout.as_secs());

    let backend = create_backend(config.backend, Arc::new(SystemExecutor::new()))?;
    let remote = HttpRemote::new(timeout, opts.ignore_cert)?;
    let backup = SnapshotBackup::new(backend.as_ref(), real_fs());

    let ctx = RunContext {
        verbosity: Verbosity(opts.verbosity),
        force_full: opts.all,
    };

    let report = SyncEngine::new(&store, &remote, backend.as_ref(), &backup, ctx)
        .with_lock_dir(&opts.lock_dir)
        .run()
        .await
        .with_context(|| format!("Sync of {} failed", store.path().display()))?;

    println!(
        "[OK] added {}, removed {}, watermark {}",
        report.added, report.removed, report.watermark_after
    );

    if !report.watermark_persisted {
        anyhow::bail!(
            "Watermark {} could not be saved to {}; the next run will replay these changes",
            report.watermark_after,
            store.path().display()
        );
    }

    Ok(())
}
