//! # blocksync - incremental IP blocklist sync for Linux firewalls
//!
//! Pulls blocklist changes from a remote reputation service and mirrors
//! them into a local kernel set that the packet filter drops.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  CLI (clap)                                                 │
//! │    └── Commands: fetch, backup, version                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SyncEngine (sync)                                          │
//! │    └── set bootstrap → fetch → apply → rule → watermark     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_json)          RemoteSource (reqwest+rustls) │
//! │    └── watermark, token         └── POST {host}/fetch       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  DiffApplier / chain          BackupSink                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Enforcer (FirewallBackend trait)                           │
//! │    ├── IpsetBackend (ipset + iptables)                      │
//! │    └── NftablesBackend                                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CommandExecutor (external binaries)                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use blocksync::backup::SnapshotBackup;
//! use blocksync::cmd_abstraction::SystemExecutor;
//! use blocksync::config::{ConfigStore, JsonConfigStore};
//! use blocksync::context::RunContext;
//! use blocksync::enforcer::create_backend;
//! use blocksync::fetcher::HttpRemote;
//! use blocksync::fs_abstraction::real_fs;
//! use blocksync::sync::SyncEngine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = JsonConfigStore::new("/etc/blocksync/acme.json");
//!     let config = store.load()?;
//!
//!     let backend = create_backend(config.backend, Arc::new(SystemExecutor::new()))?;
//!     let remote = HttpRemote::new(Duration::from_secs(30), false)?;
//!     let backup = SnapshotBackup::new(backend.as_ref(), real_fs());
//!
//!     let report = SyncEngine::new(&store, &remote, backend.as_ref(), &backup, RunContext::default())
//!         .with_lock_dir("/run/blocksync")
//!         .run()
//!         .await?;
//!     println!("added {}, removed {}", report.added, report.removed);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`applier`] - Applies a change set to the kernel set
//! - [`backup`] - Set and rule snapshots
//! - [`chain`] - Set and enforcement-rule bootstrap
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - External command execution
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration record and store
//! - [`context`] - Per-run settings (verbosity, forced full fetch)
//! - [`enforcer`] - Firewall backend abstraction (ipset, nftables)
//! - [`error`] - Sync error taxonomy
//! - [`fetcher`] - Remote service client
//! - [`fs_abstraction`] - Filesystem seam for snapshots
//! - [`lock`] - Per-blocklist file locking
//! - [`sync`] - Sync state machine
//! - [`validation`] - Input validation

pub mod applier;
pub mod backup;
pub mod chain;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod context;
pub mod enforcer;
pub mod error;
pub mod fetcher;
pub mod fs_abstraction;
pub mod lock;
pub mod sync;
pub mod validation;

pub use config::Config;
pub use error::SyncError;
pub use sync::{SyncEngine, SyncReport, SyncState};
