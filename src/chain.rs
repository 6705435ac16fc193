//! Set and enforcement-rule bootstrap.
//!
//! A set that no rule references blocks nothing, so both steps are
//! fatal when the kernel refuses them.

use tracing::{debug, info};

use crate::config::Config;
use crate::context::RunContext;
use crate::enforcer::FirewallBackend;
use crate::error::SyncError;

/// What [`ensure_enforced`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// Rule wiring is disabled in the config
    Skipped,
    AlreadyPresent,
    Created,
}

impl ChainStatus {
    pub fn created(self) -> bool {
        self == ChainStatus::Created
    }
}

fn executor_error(e: anyhow::Error) -> SyncError {
    SyncError::Executor(format!("{:#}", e))
}

/// Make sure the kernel set exists. Returns `true` if it was created.
pub async fn ensure_set(backend: &dyn FirewallBackend, set: &str) -> Result<bool, SyncError> {
    if backend.set_exists(set).await.map_err(executor_error)? {
        debug!("Set {} already exists", set);
        return Ok(false);
    }

    if !backend.create_set(set).await.map_err(executor_error)? {
        return Err(SyncError::SetBootstrap(set.to_string()));
    }
    Ok(true)
}

/// Install the drop rule for `set` unless one is already there.
///
/// Never creates a second rule: the probe runs first on every call.
pub async fn ensure_enforced(
    backend: &dyn FirewallBackend,
    set: &str,
    config: &Config,
    ctx: &RunContext,
) -> Result<ChainStatus, SyncError> {
    if !config.auto_create_chain_rules {
        if ctx.verbosity.details() {
            debug!(
                "Rule wiring for {} skipped (autocreateIptables is off)",
                set
            );
        }
        return Ok(ChainStatus::Skipped);
    }

    if backend
        .rule_exists(set, &config.chain)
        .await
        .map_err(executor_error)?
    {
        debug!("{} already drops members of {}", config.chain, set);
        return Ok(ChainStatus::AlreadyPresent);
    }

    if !backend
        .define_rule(set, &config.chain)
        .await
        .map_err(executor_error)?
    {
        return Err(SyncError::ChainBootstrap(set.to_string()));
    }

    info!("Enforcement rule for {} created in {}", set, config.chain);
    Ok(ChainStatus::Created)
}
