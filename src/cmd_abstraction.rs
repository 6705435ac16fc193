//! Process execution seam for the packet-filter backends.
//!
//! Every `ipset`, `iptables` and `nft` invocation goes through
//! [`CommandExecutor`], so backends can be exercised in tests with
//! `MockCommandExecutor` instead of touching the kernel.

use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Captured result of one external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status was zero
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    /// First line of stderr, for one-line log messages.
    pub fn first_error_line(&self) -> &str {
        self.stderr.lines().next().unwrap_or("").trim()
    }
}

/// Runs external binaries.
///
/// `Err` means the binary could not be started at all (missing, not
/// executable). A command that ran and exited non-zero is `Ok` with
/// `success == false`; callers decide whether that is fatal.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Same as [`execute`](Self::execute) but feeds `stdin` to the child.
    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;
}

/// Executor backed by `std::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for SystemExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute {}", cmd))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }

    fn execute_with_stdin(
        &self,
        cmd: &str,
        args: &[String],
        stdin_data: &str,
    ) -> Result<CommandOutput> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd))?;

        // The child may exit before reading everything (EPIPE). It is still
        // reaped, and a short write counts as a refusal, not a spawn failure.
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(stdin_data.as_bytes()),
            None => Ok(()),
        };

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", cmd))?;

        if let Err(ref e) = written {
            debug!("Writing stdin to {} failed: {}", cmd, e);
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success() && written.is_ok(),
            code: output.status.code(),
        })
    }
}

/// Convert borrowed args to the owned form the trait takes.
///
/// mockall can't express `&[&str]` with its lifetimes, hence `&[String]`.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
