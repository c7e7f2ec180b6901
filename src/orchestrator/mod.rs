// backuptool/src/orchestrator/mod.rs
pub mod job;
pub mod locks;
pub(crate) mod runner;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::{AppConfig, TargetConfig};
use crate::errors::{RepoError, TriggerError};
use crate::notify::GotifyNotifier;
use crate::repo::{RepoAccess, RepoSnapshot, RepositoryClient};
use crate::snapshot::SnapshotProvider;
use crate::sync::RemoteSync;

use job::{FailureReason, JobOutcome, JobPhase, JobRecord, PhaseReport};
use locks::LockRegistry;

pub use runner::RetryPolicy;

struct JobEntry {
    record: JobRecord,
    cancel: CancellationToken,
}

/// In-memory job table; job state lives only as long as the process.
#[derive(Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
}

impl JobStore {
    fn insert(&self, record: JobRecord, cancel: CancellationToken) {
        self.jobs
            .lock()
            .insert(record.id, JobEntry { record, cancel });
    }

    pub(crate) fn advance(&self, id: Uuid, phase: JobPhase) {
        if let Some(entry) = self.jobs.lock().get_mut(&id) {
            entry.record.advance(phase);
        }
    }

    pub(crate) fn record_phase(&self, id: Uuid, report: PhaseReport) {
        if let Some(entry) = self.jobs.lock().get_mut(&id) {
            entry.record.record_phase(report);
        }
    }

    pub(crate) fn finish(
        &self,
        id: Uuid,
        outcome: JobOutcome,
        failure: Option<FailureReason>,
    ) -> Option<JobRecord> {
        let mut jobs = self.jobs.lock();
        let entry = jobs.get_mut(&id)?;
        entry.record.finish(outcome, failure);
        Some(entry.record.clone())
    }

    pub fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.jobs.lock().get(&id).map(|e| e.record.clone())
    }

    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> =
            self.jobs.lock().values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records
    }

    pub fn running_count(&self) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|e| !e.record.is_terminal())
            .count()
    }

    fn cancel(&self, id: Uuid) -> CancelOutcome {
        let jobs = self.jobs.lock();
        match jobs.get(&id) {
            None => CancelOutcome::Unknown,
            Some(entry) if entry.record.is_terminal() => CancelOutcome::AlreadyFinished,
            Some(entry) => {
                entry.cancel.cancel();
                CancelOutcome::Requested
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Requested,
    AlreadyFinished,
    Unknown,
}

/// The backup job orchestrator: accepts triggers, runs one worker task per
/// job, serializes jobs per target and reports results.
pub struct Orchestrator {
    config: AppConfig,
    snapshots: Arc<dyn SnapshotProvider>,
    repository: Arc<dyn RepositoryClient>,
    remote: Arc<dyn RemoteSync>,
    locks: Arc<LockRegistry>,
    store: Arc<JobStore>,
    notifier: Option<Arc<GotifyNotifier>>,
    retry: RetryPolicy,
    started_at: DateTime<Utc>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        snapshots: Arc<dyn SnapshotProvider>,
        repository: Arc<dyn RepositoryClient>,
        remote: Arc<dyn RemoteSync>,
    ) -> Self {
        Self {
            config,
            snapshots,
            repository,
            remote,
            locks: Arc::new(LockRegistry::new()),
            store: Arc::new(JobStore::default()),
            notifier: GotifyNotifier::from_env().map(Arc::new),
            retry: RetryPolicy::default(),
            started_at: Utc::now(),
        }
    }

    /// Overrides the sync retry policy; tests use this to shrink delays.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Accepts or rejects a backup request for `target_name`. Lock
    /// acquisition is atomic with respect to concurrent triggers: exactly one
    /// concurrent caller wins, the rest get `TargetBusy` synchronously.
    pub fn trigger(&self, target_name: &str) -> Result<Uuid, TriggerError> {
        let target = self
            .config
            .target(target_name)
            .ok_or_else(|| TriggerError::UnknownTarget(target_name.to_string()))?
            .clone();

        let job_id = Uuid::new_v4();
        self.locks
            .acquire(&target.name, job_id)
            .map_err(|held_by| TriggerError::TargetBusy {
                target: target.name.clone(),
                held_by,
            })?;

        let cancel = CancellationToken::new();
        self.store
            .insert(JobRecord::new(job_id, target.name.clone()), cancel.clone());
        info!(job = %job_id, target = %target.name, "trigger accepted");

        let ctx = runner::JobContext {
            job_id,
            target,
            snapshots: Arc::clone(&self.snapshots),
            repository: Arc::clone(&self.repository),
            remote: Arc::clone(&self.remote),
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            notifier: self.notifier.clone(),
            retry: self.retry.clone(),
            cancel,
        };
        tokio::spawn(runner::run(ctx));
        Ok(job_id)
    }

    pub fn job(&self, id: Uuid) -> Option<JobRecord> {
        self.store.get(id)
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        self.store.list()
    }

    /// Requests cooperative cancellation; the job still runs through its
    /// cleanup phase before reaching a terminal state.
    pub fn cancel(&self, id: Uuid) -> CancelOutcome {
        self.store.cancel(id)
    }

    pub fn targets(&self) -> &[TargetConfig] {
        &self.config.targets
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.config.target(name)
    }

    pub fn running_jobs(&self) -> usize {
        self.store.running_count()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Repository snapshot listing for the control surface. Read-only; does
    /// not take the target's job lock.
    pub async fn repo_snapshots(
        &self,
        target: &TargetConfig,
    ) -> Result<Vec<RepoSnapshot>, RepoError> {
        let repo = RepoAccess::from_target(target);
        self.repository
            .list_snapshots(&repo, None, &CancellationToken::new())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_store_lifecycle() {
        let store = JobStore::default();
        let id = Uuid::new_v4();
        store.insert(JobRecord::new(id, "tank-data"), CancellationToken::new());

        assert_eq!(store.running_count(), 1);
        store.advance(id, JobPhase::SnapshotCreating);
        store.advance(id, JobPhase::CleaningUp);
        let record = store.finish(id, JobOutcome::Failed, Some(FailureReason::Snapshot));

        assert!(record.is_some());
        assert_eq!(store.running_count(), 0);
        assert!(store.get(id).unwrap().is_terminal());
    }

    #[test]
    fn test_cancel_semantics() {
        let store = JobStore::default();
        assert_eq!(store.cancel(Uuid::new_v4()), CancelOutcome::Unknown);

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        store.insert(JobRecord::new(id, "tank-data"), cancel.clone());
        assert_eq!(store.cancel(id), CancelOutcome::Requested);
        assert!(cancel.is_cancelled());

        store.advance(id, JobPhase::SnapshotCreating);
        store.advance(id, JobPhase::CleaningUp);
        store.finish(id, JobOutcome::Failed, Some(FailureReason::Cancelled));
        assert_eq!(store.cancel(id), CancelOutcome::AlreadyFinished);
    }

    #[test]
    fn test_listing_is_newest_first() {
        let store = JobStore::default();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        store.insert(JobRecord::new(first, "a"), CancellationToken::new());
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.insert(JobRecord::new(second, "b"), CancellationToken::new());

        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second);
    }
}
