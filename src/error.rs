//! Error types for blocksync.

use thiserror::Error;

/// Reasons a sync run can abort.
///
/// Per-record problems (invalid IP syntax, an add of an existing member)
/// never surface here; they are absorbed by the diff applier.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid token: the remote service rejected the configured token")]
    InvalidToken,

    #[error("Server error: the remote service reported an internal failure")]
    Server,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid blocklist name: {0}")]
    InvalidName(String),

    #[error("Couldn't create blocklist set '{0}'")]
    SetBootstrap(String),

    #[error("Couldn't create enforcement rule for '{0}'")]
    ChainBootstrap(String),

    #[error("Command executor unavailable: {0}")]
    Executor(String),

    #[error("Lock error: {0}")]
    Lock(String),
}
