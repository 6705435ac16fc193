//! Packet-filter backends (ipset/iptables, nftables).
//!
//! A backend owns the kernel-facing half of a sync: the named set that
//! holds blocked networks and the single rule that makes the filter drop
//! traffic matching it.
//!
//! Return convention for every operation: `Err` means the command layer
//! itself is unreachable (binary missing, spawn failure) and the run
//! cannot continue; `Ok(false)` means the kernel refused this one
//! command, which callers may treat as recoverable.

mod ipset;
mod nftables;

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::sync::Arc;
use tracing::debug;

pub use ipset::IpsetBackend;
pub use nftables::NftablesBackend;

use crate::cmd_abstraction::{args_to_strings, CommandExecutor};
use crate::config::Backend;

/// Capability set of the kernel set/rule store.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Short backend name for log lines
    fn name(&self) -> &'static str;

    async fn set_exists(&self, set: &str) -> Result<bool>;

    async fn create_set(&self, set: &str) -> Result<bool>;

    async fn add_member(&self, set: &str, member: &IpNet) -> Result<bool>;

    async fn remove_member(&self, set: &str, member: &IpNet) -> Result<bool>;

    /// Remove every member, keeping the set itself
    async fn flush_set(&self, set: &str) -> Result<bool>;

    async fn list_members(&self, set: &str) -> Result<Vec<IpNet>>;

    /// Whether `chain` already drops traffic matching `set`
    async fn rule_exists(&self, set: &str, chain: &str) -> Result<bool>;

    /// Install the drop rule for `set` in `chain`
    async fn define_rule(&self, set: &str, chain: &str) -> Result<bool>;

    /// Restorable dump of the set
    async fn save_set(&self, set: &str) -> Result<String>;

    /// Restorable dump of the filter rules
    async fn save_rules(&self) -> Result<String>;
}

/// Probe for an installed backend, ipset first.
pub fn detect_backend(executor: &dyn CommandExecutor) -> Result<Backend> {
    if tool_available(executor, "ipset") && tool_available(executor, "iptables") {
        return Ok(Backend::Ipset);
    }

    if tool_available(executor, "nft") {
        return Ok(Backend::Nftables);
    }

    anyhow::bail!("No packet-filter backend available (ipset+iptables or nft required)")
}

/// Create the configured backend, failing early when its tools are missing.
pub fn create_backend(
    backend: Backend,
    executor: Arc<dyn CommandExecutor>,
) -> Result<Box<dyn FirewallBackend>> {
    let actual_backend = match backend {
        Backend::Auto => detect_backend(executor.as_ref())?,
        other => other,
    };

    match actual_backend {
        Backend::Ipset => {
            for tool in ["ipset", "iptables"] {
                if !tool_available(executor.as_ref(), tool) {
                    anyhow::bail!("You need to install '{}' to run this command", tool);
                }
            }
            Ok(Box::new(IpsetBackend::new(executor)))
        }
        Backend::Nftables => {
            if !tool_available(executor.as_ref(), "nft") {
                anyhow::bail!("You need to install 'nft' to run this command");
            }
            Ok(Box::new(NftablesBackend::new(executor)))
        }
        Backend::Auto => unreachable!(),
    }
}

fn tool_available(executor: &dyn CommandExecutor, tool: &str) -> bool {
    let available = executor
        .execute(tool, &args_to_strings(&["--version"]))
        .map(|o| o.success)
        .unwrap_or(false);
    debug!("{} available: {}", tool, available);
    available
}

/// Kernel element text for a member: bare address for host routes,
/// CIDR otherwise.
pub(crate) fn element_string(member: &IpNet) -> String {
    if member.prefix_len() == member.max_prefix_len() {
        member.addr().to_string()
    } else {
        member.to_string()
    }
}

/// Check if running as root (effective UID == 0)
pub fn is_root() -> bool {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}
