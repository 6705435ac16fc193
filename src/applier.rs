//! Applies a remote change set to the local kernel set.
//!
//! Every member command is individually idempotent: adding a present
//! member or removing an absent one is refused by the kernel, and a
//! refusal only means the record is not counted. The one fatal case is
//! a backend that cannot run commands at all.

use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::enforcer::FirewallBackend;
use crate::error::SyncError;
use crate::fetcher::ChangeRecord;
use crate::validation::validate_member;

/// Aggregate result of one apply pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyCounts {
    /// Members actually added
    pub added: usize,
    /// Members actually removed
    pub removed: usize,
    /// Records dropped for invalid IP syntax
    pub skipped: usize,
    /// Commands the kernel refused (already present / already absent)
    pub refused: usize,
    /// The set was flushed before applying
    pub flushed: bool,
}

/// Mutates one kernel set through a [`FirewallBackend`].
pub struct DiffApplier<'a> {
    backend: &'a dyn FirewallBackend,
    ctx: &'a RunContext,
}

impl<'a> DiffApplier<'a> {
    pub fn new(backend: &'a dyn FirewallBackend, ctx: &'a RunContext) -> Self {
        Self { backend, ctx }
    }

    /// Apply `changes` to `set` in received order.
    ///
    /// With `flush_first` the set is emptied beforehand, so afterwards it
    /// holds exactly the non-removed members of `changes`.
    pub async fn apply(
        &self,
        set: &str,
        changes: &[ChangeRecord],
        flush_first: bool,
    ) -> Result<ApplyCounts, SyncError> {
        let mut counts = ApplyCounts::default();

        if flush_first {
            let flushed = self
                .backend
                .flush_set(set)
                .await
                .map_err(|e| SyncError::Executor(format!("{:#}", e)))?;
            if !flushed {
                return Err(SyncError::Executor(format!(
                    "{} refused to flush {}",
                    self.backend.name(),
                    set
                )));
            }
            info!("Flushed {} before applying full snapshot", set);
            counts.flushed = true;
        }

        for record in changes {
            let member = match validate_member(&record.ip) {
                Ok(member) => member,
                Err(e) => {
                    if self.ctx.verbosity.details() {
                        debug!("Skipping '{}': {}", record.ip, e);
                    }
                    counts.skipped += 1;
                    continue;
                }
            };

            let result = if record.removed {
                self.backend.remove_member(set, &member).await
            } else {
                self.backend.add_member(set, &member).await
            };

            match result {
                Ok(true) if record.removed => counts.removed += 1,
                Ok(true) => counts.added += 1,
                Ok(false) => {
                    if self.ctx.verbosity.commands() {
                        let (verb, prep) = if record.removed {
                            ("remove", "from")
                        } else {
                            ("add", "to")
                        };
                        warn!("Kernel refused to {} {} {} {}", verb, member, prep, set);
                    }
                    counts.refused += 1;
                }
                Err(e) => return Err(SyncError::Executor(format!("{:#}", e))),
            }
        }

        if counts.added > 0 || counts.removed > 0 {
            info!(
                "Successfully added {} and removed {} IPs in {}",
                counts.added, counts.removed, set
            );
        }
        if counts.skipped > 0 {
            debug!("{} records skipped for invalid IP syntax", counts.skipped);
        }

        Ok(counts)
    }
}
