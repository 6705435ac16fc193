//! CLI argument parsing with clap.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{DEFAULT_CONFIG_DIR, DEFAULT_CONFIG_NAME};
use crate::lock::DEFAULT_LOCK_DIR;

#[derive(Parser)]
#[command(name = "blocksync")]
#[command(author, version, about = "Incremental IP blocklist sync for ipset and nftables")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config name (bare names are looked up in --config-dir)
    #[arg(short = 'C', long, default_value = DEFAULT_CONFIG_NAME, global = true)]
    pub config: String,

    /// Directory holding config files and backups
    #[arg(long, default_value = DEFAULT_CONFIG_DIR, global = true)]
    pub config_dir: PathBuf,

    /// Directory for per-blocklist lock files
    #[arg(long, default_value = DEFAULT_LOCK_DIR, global = true)]
    pub lock_dir: PathBuf,

    /// Quiet mode (for cron/systemd timer)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbosity (-v notices, -vv skipped records, -vvv refused commands)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch remote changes and apply them to the local set
    #[command(visible_alias = "u", alias = "upd", alias = "update")]
    Fetch {
        /// Remote service host (overrides the config)
        #[arg(short = 'r', long)]
        host: Option<String>,

        /// API token (overrides the config and BLOCKSYNC_TOKEN)
        #[arg(short = 't', long)]
        token: Option<String>,

        /// Fetch the full remote list instead of changes
        #[arg(short = 'a', long)]
        all: bool,

        /// Skip TLS certificate validation
        #[arg(short = 'i', long)]
        ignorecert: bool,

        /// Request timeout in seconds (overrides the config)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Write snapshots of the set and/or the filter rules
    #[command(visible_alias = "b", alias = "bak")]
    Backup {
        /// Snapshot the blocklist set (default unless only --rules is given)
        #[arg(short = 's', long)]
        set: bool,

        /// Snapshot the filter rules
        #[arg(short = 't', long)]
        rules: bool,
    },

    /// Show version
    Version,
}
