//! One sync run for one blocklist.
//!
//! Steps run strictly in order, each awaited before the next:
//!
//! ```text
//! Init -> SetBootstrapped -> Fetched -> Applied -> ChainEnsured
//!      -> WatermarkPersisted -> BackupTriggered -> Done
//! ```
//!
//! An empty fetch result jumps straight to `Done`. Any other failure
//! aborts the run with a [`SyncAbort`] naming the last state reached.
//! The watermark is only written once the set and its enforcement rule
//! are both in place; kernel changes made before a later failure are left
//! as they are and are replayed safely by the next run.

use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::applier::DiffApplier;
use crate::backup::BackupSink;
use crate::chain::{ensure_enforced, ensure_set};
use crate::config::{derive_blocklist_name, ConfigStore};
use crate::context::RunContext;
use crate::enforcer::FirewallBackend;
use crate::error::SyncError;
use crate::fetcher::{FetchOutcome, RemoteSource};
use crate::lock::LockGuard;
use crate::validation::validate_set_name;

/// Progress of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncState {
    Init,
    SetBootstrapped,
    Fetched,
    Applied,
    ChainEnsured,
    WatermarkPersisted,
    BackupTriggered,
    Done,
}

/// A run that stopped early.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct SyncAbort {
    /// Last state completed before the failure
    pub at: SyncState,
    pub error: SyncError,
}

impl SyncAbort {
    fn new(at: SyncState, error: SyncError) -> Self {
        Self { at, error }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub blocklist: String,
    pub final_state: SyncState,
    pub added: usize,
    pub removed: usize,
    pub skipped: usize,
    pub watermark_before: i64,
    pub watermark_after: i64,
    pub flushed: bool,
    pub set_created: bool,
    pub chain_created: bool,
    /// `false` when the config write failed after a successful apply
    pub watermark_persisted: bool,
    pub backup_ok: bool,
}

impl SyncReport {
    fn new(blocklist: String, watermark: i64) -> Self {
        Self {
            blocklist,
            final_state: SyncState::Init,
            added: 0,
            removed: 0,
            skipped: 0,
            watermark_before: watermark,
            watermark_after: watermark,
            flushed: false,
            set_created: false,
            chain_created: false,
            watermark_persisted: true,
            backup_ok: true,
        }
    }

    /// Everything that should have happened did.
    pub fn is_clean(&self) -> bool {
        self.final_state == SyncState::Done && self.watermark_persisted
    }
}

/// Drives one run over its collaborators.
pub struct SyncEngine<'a> {
    store: &'a dyn ConfigStore,
    remote: &'a dyn RemoteSource,
    backend: &'a dyn FirewallBackend,
    backup: &'a dyn BackupSink,
    ctx: RunContext,
    lock_dir: Option<PathBuf>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        store: &'a dyn ConfigStore,
        remote: &'a dyn RemoteSource,
        backend: &'a dyn FirewallBackend,
        backup: &'a dyn BackupSink,
        ctx: RunContext,
    ) -> Self {
        Self {
            store,
            remote,
            backend,
            backup,
            ctx,
            lock_dir: None,
        }
    }

    /// Serialize runs for the same blocklist through lock files in `dir`.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    pub async fn run(&self) -> Result<SyncReport, SyncAbort> {
        let abort = |at: SyncState| move |e: SyncError| SyncAbort::new(at, e);

        let blocklist = derive_blocklist_name(&self.store.path().to_string_lossy());
        validate_set_name(&blocklist)
            .map_err(|e| SyncError::InvalidName(format!("{:#}", e)))
            .map_err(abort(SyncState::Init))?;

        // The config is read under the lock so a concurrent run's watermark
        // is never overwritten with a stale one.
        let _lock = match &self.lock_dir {
            Some(dir) => Some(LockGuard::acquire(dir, &blocklist).map_err(abort(SyncState::Init))?),
            None => None,
        };

        let mut config = self.store.load().map_err(abort(SyncState::Init))?;

        let mut report = SyncReport::new(blocklist.clone(), config.watermark());
        info!(
            "Syncing {} via {} (watermark {})",
            blocklist,
            self.backend.name(),
            report.watermark_before
        );

        // Init -> SetBootstrapped
        report.set_created = ensure_set(self.backend, &blocklist)
            .await
            .map_err(abort(SyncState::Init))?;
        report.final_state = SyncState::SetBootstrapped;

        // SetBootstrapped -> Fetched
        let force_full = self.ctx.force_full || config.needs_full_fetch();
        let outcome = self
            .remote
            .fetch(&config.host, &config.token, &config.filter, force_full)
            .await
            .map_err(abort(SyncState::SetBootstrapped))?;

        let response = match outcome {
            FetchOutcome::Empty => {
                if self.ctx.verbosity.notices() {
                    info!("Nothing to do for {}", blocklist);
                }
                report.final_state = SyncState::Done;
                return Ok(report);
            }
            FetchOutcome::Changes(response) => response,
        };
        report.final_state = SyncState::Fetched;

        // Fetched -> Applied
        let flush_first = response.is_full_snapshot || force_full;
        let counts = DiffApplier::new(self.backend, &self.ctx)
            .apply(&blocklist, &response.changes, flush_first)
            .await
            .map_err(abort(SyncState::Fetched))?;
        report.added = counts.added;
        report.removed = counts.removed;
        report.skipped = counts.skipped;
        report.flushed = counts.flushed;
        report.final_state = SyncState::Applied;

        // Applied -> ChainEnsured
        report.chain_created = ensure_enforced(self.backend, &blocklist, &config, &self.ctx)
            .await
            .map_err(abort(SyncState::Applied))?
            .created();
        report.final_state = SyncState::ChainEnsured;

        // ChainEnsured -> WatermarkPersisted
        if response.new_watermark < report.watermark_before {
            warn!(
                "Remote timestamp {} is older than watermark {}; keeping {}",
                response.new_watermark, report.watermark_before, report.watermark_before
            );
        }
        report.watermark_after = config.advance_watermark(response.new_watermark);
        if let Err(e) = self.store.persist(&config) {
            error!(
                "Kernel set is updated but watermark {} was not saved to {}: {}",
                report.watermark_after,
                self.store.path().display(),
                e
            );
            report.watermark_persisted = false;
        }
        report.final_state = SyncState::WatermarkPersisted;

        // WatermarkPersisted -> BackupTriggered
        report.backup_ok = self
            .backup
            .trigger_backup(self.store.path(), true, false)
            .await;
        if !report.backup_ok {
            warn!("Backup of {} failed; sync result is unaffected", blocklist);
        }
        report.final_state = SyncState::BackupTriggered;

        info!(
            "Sync of {} finished: {} added, {} removed, {} skipped, watermark {}",
            blocklist, report.added, report.removed, report.skipped, report.watermark_after
        );
        report.final_state = SyncState::Done;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Filter, JsonConfigStore, SecureString};
    use crate::enforcer::mock::{Call, MockBackend};
    use crate::fetcher::parse_fetch_response;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const SET: &str = "blocklist_acme";

    /// Serves one canned wire body and records what was asked for.
    struct CannedRemote {
        body: &'static str,
        calls: AtomicUsize,
        last_force_full: AtomicBool,
    }

    impl CannedRemote {
        fn new(body: &'static str) -> Self {
            Self {
                body,
                calls: AtomicUsize::new(0),
                last_force_full: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl RemoteSource for CannedRemote {
        async fn fetch(
            &self,
            _host: &str,
            _token: &SecureString,
            _filter: &Filter,
            force_full: bool,
        ) -> Result<FetchOutcome, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_force_full.store(force_full, Ordering::SeqCst);
            parse_fetch_response(self.body)
        }
    }

    struct MemoryStore {
        path: PathBuf,
        config: Mutex<Config>,
        persisted: Mutex<Vec<i64>>,
        loads: AtomicUsize,
        fail_persist: bool,
    }

    impl MemoryStore {
        fn new(since: i64) -> Self {
            Self {
                path: PathBuf::from("/etc/blocksync/acme.json"),
                config: Mutex::new(Config {
                    host: "https://reports.example.com".to_string(),
                    token: SecureString::from("tok-123"),
                    filter: Filter {
                        since,
                        ..Default::default()
                    },
                    ..Default::default()
                }),
                persisted: Mutex::new(Vec::new()),
                loads: AtomicUsize::new(0),
                fail_persist: false,
            }
        }

        fn with_chain_rules(self) -> Self {
            self.config.lock().unwrap().auto_create_chain_rules = true;
            self
        }

        fn persisted(&self) -> Vec<i64> {
            self.persisted.lock().unwrap().clone()
        }
    }

    impl ConfigStore for MemoryStore {
        fn load(&self) -> Result<Config, SyncError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.config.lock().unwrap().clone())
        }

        fn persist(&self, config: &Config) -> Result<(), SyncError> {
            if self.fail_persist {
                return Err(SyncError::Config("disk full".to_string()));
            }
            self.persisted.lock().unwrap().push(config.watermark());
            *self.config.lock().unwrap() = config.clone();
            Ok(())
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    #[derive(Default)]
    struct RecordingBackup {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl BackupSink for RecordingBackup {
        async fn trigger_backup(&self, _path: &Path, include_set: bool, include_rules: bool) -> bool {
            assert!(include_set);
            assert!(!include_rules);
            self.calls.fetch_add(1, Ordering::SeqCst);
            !self.fail
        }
    }

    async fn run(
        store: &MemoryStore,
        remote: &CannedRemote,
        backend: &MockBackend,
        backup: &RecordingBackup,
        ctx: RunContext,
    ) -> Result<SyncReport, SyncAbort> {
        SyncEngine::new(store, remote, backend, backup, ctx).run().await
    }

    const ONE_ADD: &str = r#"{"ips":[{"ip":"10.0.0.1","deleted":0}],"currentTimestamp":1000,"full":false}"#;

    #[tokio::test]
    async fn test_empty_result_is_noop() {
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new("[]");
        let backend = MockBackend::new().with_set(SET, &["10.9.9.9"]);
        let backup = RecordingBackup::default();

        let report = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap();

        assert_eq!(report.final_state, SyncState::Done);
        assert_eq!(report.watermark_after, 500);
        assert_eq!(backend.mutation_calls(), 0);
        assert!(store.persisted().is_empty());
        assert_eq!(backup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_result_with_forced_full_does_not_flush() {
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new("[]");
        let backend = MockBackend::new().with_set(SET, &["10.9.9.9"]);
        let backup = RecordingBackup::default();

        run(&store, &remote, &backend, &backup, RunContext::default().with_force_full(true))
            .await
            .unwrap();

        assert!(remote.last_force_full.load(Ordering::SeqCst));
        assert!(!backend.calls().iter().any(|c| matches!(c, Call::Flush(_))));
        assert_eq!(backend.members(SET).len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_token_leaves_state_untouched() {
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new("-1");
        let backend = MockBackend::new().with_set(SET, &[]);
        let backup = RecordingBackup::default();

        let abort = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap_err();

        assert!(matches!(abort.error, SyncError::InvalidToken));
        assert_eq!(abort.at, SyncState::SetBootstrapped);
        assert!(store.persisted().is_empty());
        assert_eq!(backend.mutation_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_token_leaves_config_file_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("acme.json");
        let original = r#"{"host":"https://reports.example.com","token":"tok-123","filter":{"since":500},"comment":"kept"}"#;
        std::fs::write(&path, original).unwrap();

        let store = JsonConfigStore::new(&path);
        let remote = CannedRemote::new("-1");
        let backend = MockBackend::new().with_set(SET, &[]);
        let backup = RecordingBackup::default();

        let abort = SyncEngine::new(&store, &remote, &backend, &backup, RunContext::default())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(abort.error, SyncError::InvalidToken));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
        assert_eq!(backend.mutation_calls(), 0);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_server_error_sentinel() {
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new("2");
        let backend = MockBackend::new().with_set(SET, &[]);
        let backup = RecordingBackup::default();

        let abort = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap_err();
        assert!(matches!(abort.error, SyncError::Server));
        assert!(store.persisted().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_response_does_not_advance_watermark() {
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new("{\"ips\": [");
        let backend = MockBackend::new().with_set(SET, &[]);
        let backup = RecordingBackup::default();

        let abort = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap_err();
        assert!(matches!(abort.error, SyncError::Parse(_)));
        assert!(store.persisted().is_empty());
    }

    #[tokio::test]
    async fn test_delta_adds_member_and_advances_watermark() {
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend::new().with_set(SET, &[]);
        let backup = RecordingBackup::default();

        let report = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap();

        let adds: Vec<_> = backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Add(..)))
            .collect();
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0], Call::Add(SET.to_string(), "10.0.0.1/32".parse().unwrap()));
        assert_eq!(store.persisted(), vec![1000]);
        assert_eq!(report.added, 1);
        assert!(!report.flushed);
        assert!(report.is_clean());
        assert_eq!(backup.calls.load(Ordering::SeqCst), 1);
        assert!(!remote.last_force_full.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_invalid_ip_skipped_but_watermark_advances() {
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new(
            r#"{"ips":[{"ip":"999.999.999.999","deleted":0}],"currentTimestamp":1000,"full":false}"#,
        );
        let backend = MockBackend::new().with_set(SET, &[]);
        let backup = RecordingBackup::default();

        let report = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap();

        assert_eq!(backend.mutation_calls(), 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.persisted(), vec![1000]);
    }

    #[tokio::test]
    async fn test_zero_watermark_forces_full_fetch_and_flush() {
        let store = MemoryStore::new(0);
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend::new().with_set(SET, &["10.9.9.9"]);
        let backup = RecordingBackup::default();

        let report = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap();

        assert!(remote.last_force_full.load(Ordering::SeqCst));
        assert!(report.flushed);
        let members: Vec<String> = backend.members(SET).iter().map(|m| m.to_string()).collect();
        assert_eq!(members, vec!["10.0.0.1/32"]);
    }

    #[tokio::test]
    async fn test_full_snapshot_flag_flushes() {
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new(
            r#"{"ips":[{"ip":"10.0.0.1","deleted":0}],"currentTimestamp":1000,"full":true}"#,
        );
        let backend = MockBackend::new().with_set(SET, &["10.9.9.9"]);
        let backup = RecordingBackup::default();

        let report = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap();
        assert!(report.flushed);
        assert_eq!(backend.members(SET).len(), 1);
    }

    #[tokio::test]
    async fn test_watermark_never_moves_backwards() {
        let store = MemoryStore::new(5000);
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend::new().with_set(SET, &[]);
        let backup = RecordingBackup::default();

        let report = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap();
        assert_eq!(report.watermark_after, 5000);
        assert_eq!(store.persisted(), vec![5000]);
    }

    #[tokio::test]
    async fn test_missing_set_is_created_first() {
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend::new();
        let backup = RecordingBackup::default();

        let report = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap();

        assert!(report.set_created);
        let calls = backend.calls();
        let create = calls.iter().position(|c| matches!(c, Call::CreateSet(_))).unwrap();
        let add = calls.iter().position(|c| matches!(c, Call::Add(..))).unwrap();
        assert!(create < add);
    }

    #[tokio::test]
    async fn test_set_creation_failure_aborts_before_fetch() {
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend {
            refuse_create_set: true,
            ..MockBackend::new()
        };
        let backup = RecordingBackup::default();

        let abort = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap_err();

        assert!(matches!(abort.error, SyncError::SetBootstrap(_)));
        assert_eq!(abort.at, SyncState::Init);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chain_failure_does_not_persist_watermark() {
        let store = MemoryStore::new(500).with_chain_rules();
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend {
            refuse_define_rule: true,
            ..MockBackend::new().with_set(SET, &[])
        };
        let backup = RecordingBackup::default();

        let abort = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap_err();

        assert!(matches!(abort.error, SyncError::ChainBootstrap(_)));
        assert_eq!(abort.at, SyncState::Applied);
        assert!(store.persisted().is_empty());
        assert_eq!(backup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chain_rule_created_when_enabled() {
        let store = MemoryStore::new(500).with_chain_rules();
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend::new().with_set(SET, &[]);
        let backup = RecordingBackup::default();

        let report = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap();
        assert!(report.chain_created);
        assert!(backend
            .calls()
            .contains(&Call::DefineRule(SET.to_string(), "INPUT".to_string())));
    }

    #[tokio::test]
    async fn test_persist_failure_is_reported_not_fatal() {
        let store = MemoryStore {
            fail_persist: true,
            ..MemoryStore::new(500)
        };
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend::new().with_set(SET, &[]);
        let backup = RecordingBackup::default();

        let report = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap();

        assert_eq!(report.final_state, SyncState::Done);
        assert!(!report.watermark_persisted);
        assert!(!report.is_clean());
        assert_eq!(report.added, 1);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backup_failure_is_advisory() {
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend::new().with_set(SET, &[]);
        let backup = RecordingBackup {
            fail: true,
            ..Default::default()
        };

        let report = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap();
        assert!(!report.backup_ok);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_unreachable_executor_aborts_before_persist() {
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend {
            unreachable: true,
            ..MockBackend::new().with_set(SET, &[])
        };
        let backup = RecordingBackup::default();

        let abort = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap_err();
        assert!(matches!(abort.error, SyncError::Executor(_)));
        assert_eq!(abort.at, SyncState::Fetched);
        assert!(store.persisted().is_empty());
    }

    #[tokio::test]
    async fn test_held_lock_aborts_before_kernel_access() {
        let dir = TempDir::new().unwrap();
        let _held = LockGuard::acquire(dir.path(), SET).unwrap();

        let store = MemoryStore::new(500);
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend::new().with_set(SET, &[]);
        let backup = RecordingBackup::default();

        let abort = SyncEngine::new(&store, &remote, &backend, &backup, RunContext::default())
            .with_lock_dir(dir.path())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(abort.error, SyncError::Lock(_)));
        assert!(backend.calls().is_empty());
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lock_released_after_run() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new(500);
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend::new().with_set(SET, &[]);
        let backup = RecordingBackup::default();

        SyncEngine::new(&store, &remote, &backend, &backup, RunContext::default())
            .with_lock_dir(dir.path())
            .run()
            .await
            .unwrap();

        assert!(LockGuard::acquire(dir.path(), SET).is_ok());
    }

    #[tokio::test]
    async fn test_overlong_blocklist_name_rejected() {
        let mut store = MemoryStore::new(500);
        store.path = PathBuf::from("/etc/blocksync/a-very-long-reputation-feed-name.json");
        let remote = CannedRemote::new(ONE_ADD);
        let backend = MockBackend::new();
        let backup = RecordingBackup::default();

        let abort = run(&store, &remote, &backend, &backup, RunContext::default())
            .await
            .unwrap_err();
        assert!(matches!(abort.error, SyncError::InvalidName(_)));
        assert!(backend.calls().is_empty());
    }
}
