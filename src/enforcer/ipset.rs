//! ipset backend, enforced by an iptables rule.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use std::sync::Arc;
use tracing::{debug, info};

use super::{element_string, FirewallBackend};
use crate::cmd_abstraction::{args_to_strings, CommandExecutor, CommandOutput};
use crate::validation::validate_member;

const IPSET: &str = "ipset";
const IPTABLES: &str = "iptables";
const IPTABLES_SAVE: &str = "iptables-save";

/// Room for the largest published reputation lists
const MAX_ELEMENTS: &str = "4000000";

/// ipset backend (hash:net set, one `--match-set` DROP rule)
pub struct IpsetBackend {
    executor: Arc<dyn CommandExecutor>,
}

impl IpsetBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = self.executor.execute(program, &args_to_strings(args))?;
        if !output.success {
            debug!(
                "{} {} refused: {}",
                program,
                args.join(" "),
                output.first_error_line()
            );
        }
        Ok(output)
    }

    fn rule_args<'a>(&self, action: &'a str, chain: &'a str, set: &'a str) -> [&'a str; 10] {
        [
            action, chain,
            "-m", "set", "--match-set", set, "src",
            "-j", "DROP", "-w",
        ]
    }
}

#[async_trait]
impl FirewallBackend for IpsetBackend {
    fn name(&self) -> &'static str {
        "ipset"
    }

    async fn set_exists(&self, set: &str) -> Result<bool> {
        Ok(self.run(IPSET, &["list", set, "-name"])?.success)
    }

    async fn create_set(&self, set: &str) -> Result<bool> {
        let created = self
            .run(IPSET, &["create", set, "hash:net", "family", "inet", "maxelem", MAX_ELEMENTS])?
            .success;
        if created {
            info!("Created ipset {}", set);
        }
        Ok(created)
    }

    async fn add_member(&self, set: &str, member: &IpNet) -> Result<bool> {
        // No -exist: an existing member exits non-zero and is not counted
        Ok(self.run(IPSET, &["add", set, &element_string(member)])?.success)
    }

    async fn remove_member(&self, set: &str, member: &IpNet) -> Result<bool> {
        Ok(self.run(IPSET, &["del", set, &element_string(member)])?.success)
    }

    async fn flush_set(&self, set: &str) -> Result<bool> {
        Ok(self.run(IPSET, &["flush", set])?.success)
    }

    async fn list_members(&self, set: &str) -> Result<Vec<IpNet>> {
        let output = self.run(IPSET, &["list", set])?;
        if !output.success {
            anyhow::bail!("ipset list {} failed: {}", set, output.first_error_line());
        }
        Ok(parse_members(&output.stdout))
    }

    async fn rule_exists(&self, set: &str, chain: &str) -> Result<bool> {
        Ok(self.run(IPTABLES, &self.rule_args("-C", chain, set))?.success)
    }

    async fn define_rule(&self, set: &str, chain: &str) -> Result<bool> {
        let created = self.run(IPTABLES, &self.rule_args("-I", chain, set))?.success;
        if created {
            info!("Inserted iptables rule: {} drops members of {}", chain, set);
        }
        Ok(created)
    }

    async fn save_set(&self, set: &str) -> Result<String> {
        let output = self.run(IPSET, &["save", set])?;
        if !output.success {
            anyhow::bail!("ipset save {} failed: {}", set, output.first_error_line());
        }
        Ok(output.stdout)
    }

    async fn save_rules(&self) -> Result<String> {
        let output = self
            .run(IPTABLES_SAVE, &[])
            .context("Failed to dump iptables rules")?;
        if !output.success {
            anyhow::bail!("iptables-save failed: {}", output.first_error_line());
        }
        Ok(output.stdout)
    }
}

/// Parse the `Members:` section of `ipset list` output.
fn parse_members(output: &str) -> Vec<IpNet> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("Members:"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|entry| validate_member(entry).ok())
        .collect()
}
