//! nftables backend implementation.
//!
//! All blocklists live in one `ip blocksync` table: one interval set per
//! blocklist and one base chain per hooked chain name.

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{element_string, FirewallBackend};
use crate::cmd_abstraction::{args_to_strings, CommandExecutor, CommandOutput};
use crate::validation::validate_member;

const NFT: &str = "nft";
const FAMILY: &str = "ip";
const TABLE_NAME: &str = "blocksync";

/// nftables backend
pub struct NftablesBackend {
    executor: Arc<dyn CommandExecutor>,
}

impl NftablesBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.executor.execute(NFT, &args_to_strings(args))?;
        if !output.success {
            debug!("nft {} refused: {}", args.join(" "), output.first_error_line());
        }
        Ok(output)
    }

    /// Execute an nft script through stdin (`nft -f -`)
    fn run_script(&self, script: &str) -> Result<bool> {
        debug!("Executing nft script:\n{}", script);
        let output = self
            .executor
            .execute_with_stdin(NFT, &args_to_strings(&["-f", "-"]), script)?;
        if !output.success {
            debug!("nft script refused: {}", output.first_error_line());
        }
        Ok(output.success)
    }

    fn element_args<'a>(&self, verb: &'a str, set: &'a str, element: &'a str) -> [&'a str; 8] {
        [verb, "element", FAMILY, TABLE_NAME, set, "{", element, "}"]
    }
}

/// nftables hook for an iptables-style chain name
fn hook_for_chain(chain: &str) -> Option<&'static str> {
    match chain.to_ascii_uppercase().as_str() {
        "INPUT" => Some("input"),
        "FORWARD" => Some("forward"),
        "PREROUTING" => Some("prerouting"),
        _ => None,
    }
}

/// `auto-merge` lets a host or subnet be added inside a network that is
/// already a member; without it nft rejects overlapping intervals.
fn generate_set_script(set: &str) -> String {
    let mut script = String::new();
    script.push_str(&format!("add table {} {}\n", FAMILY, TABLE_NAME));
    script.push_str(&format!(
        "add set {} {} {} {{ type ipv4_addr; flags interval; auto-merge; }}\n",
        FAMILY, TABLE_NAME, set
    ));
    script
}

fn generate_rule_script(set: &str, hook: &str) -> String {
    let mut script = String::new();
    script.push_str(&format!("add table {} {}\n", FAMILY, TABLE_NAME));
    script.push_str(&format!(
        "add chain {} {} {} {{ type filter hook {} priority -1; policy accept; }}\n",
        FAMILY, TABLE_NAME, hook, hook
    ));
    script.push_str(&format!(
        "add rule {} {} {} ip saddr @{} counter drop\n",
        FAMILY, TABLE_NAME, hook, set
    ));
    script
}

/// Whether `nft list chain` output contains a rule matching `@set`
fn chain_references_set(output: &str, set: &str) -> bool {
    let needle = format!("@{}", set);
    output
        .lines()
        .any(|line| line.split_whitespace().any(|token| token == needle))
}

/// Extract elements from `nft list set` output; the list may span lines.
fn parse_set_elements(output: &str) -> Vec<IpNet> {
    const MARKER: &str = "elements = {";
    let Some(start) = output.find(MARKER) else {
        return Vec::new();
    };
    let rest = &output[start + MARKER.len()..];
    let end = rest.find('}').unwrap_or(rest.len());

    rest[..end]
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .filter_map(|s| validate_member(s).ok())
        .collect()
}

#[async_trait]
impl FirewallBackend for NftablesBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    async fn set_exists(&self, set: &str) -> Result<bool> {
        Ok(self.run(&["list", "set", FAMILY, TABLE_NAME, set])?.success)
    }

    async fn create_set(&self, set: &str) -> Result<bool> {
        let created = self.run_script(&generate_set_script(set))?;
        if created {
            info!("Created nftables set {} {} {}", FAMILY, TABLE_NAME, set);
        }
        Ok(created)
    }

    async fn add_member(&self, set: &str, member: &IpNet) -> Result<bool> {
        let element = element_string(member);
        Ok(self.run(&self.element_args("add", set, &element))?.success)
    }

    async fn remove_member(&self, set: &str, member: &IpNet) -> Result<bool> {
        let element = element_string(member);
        Ok(self.run(&self.element_args("delete", set, &element))?.success)
    }

    async fn flush_set(&self, set: &str) -> Result<bool> {
        Ok(self.run(&["flush", "set", FAMILY, TABLE_NAME, set])?.success)
    }

    async fn list_members(&self, set: &str) -> Result<Vec<IpNet>> {
        let output = self.run(&["list", "set", FAMILY, TABLE_NAME, set])?;
        if !output.success {
            anyhow::bail!("nft list set {} failed: {}", set, output.first_error_line());
        }
        Ok(parse_set_elements(&output.stdout))
    }

    async fn rule_exists(&self, set: &str, chain: &str) -> Result<bool> {
        let Some(hook) = hook_for_chain(chain) else {
            return Ok(false);
        };
        let output = self.run(&["list", "chain", FAMILY, TABLE_NAME, hook])?;
        Ok(output.success && chain_references_set(&output.stdout, set))
    }

    async fn define_rule(&self, set: &str, chain: &str) -> Result<bool> {
        let Some(hook) = hook_for_chain(chain) else {
            warn!(
                "Chain '{}' has no nftables hook (use INPUT, FORWARD or PREROUTING)",
                chain
            );
            return Ok(false);
        };
        let created = self.run_script(&generate_rule_script(set, hook))?;
        if created {
            info!("Added nftables rule: {} drops members of {}", hook, set);
        }
        Ok(created)
    }

    async fn save_set(&self, set: &str) -> Result<String> {
        let output = self.run(&["list", "set", FAMILY, TABLE_NAME, set])?;
        if !output.success {
            anyhow::bail!("nft list set {} failed: {}", set, output.first_error_line());
        }
        Ok(output.stdout)
    }

    async fn save_rules(&self) -> Result<String> {
        let output = self.run(&["list", "table", FAMILY, TABLE_NAME])?;
        if !output.success {
            anyhow::bail!("nft list table failed: {}", output.first_error_line());
        }
        Ok(output.stdout)
    }
}
