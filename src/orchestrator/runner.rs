// backuptool/src/orchestrator/runner.rs
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::TargetConfig;
use crate::errors::{RepoError, SnapshotError, SyncError};
use crate::notify::GotifyNotifier;
use crate::orchestrator::JobStore;
use crate::orchestrator::job::{
    FailureReason, JobOutcome, JobPhase, PhaseOutcome, PhaseReport,
};
use crate::orchestrator::locks::LockRegistry;
use crate::repo::{RepoAccess, RepositoryClient, newest_snapshot_id};
use crate::snapshot::{SnapshotHandle, SnapshotProvider};
use crate::sync::{RemoteSync, SyncReport};

/// Bounded exponential backoff for transient sync failures. Carried as data
/// so tests can shrink the delays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub sync_attempts: u32,
    pub sync_backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            sync_attempts: 3,
            sync_backoff_base: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.sync_backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Everything one worker task needs to drive a job to a terminal state.
pub(crate) struct JobContext {
    pub job_id: Uuid,
    pub target: TargetConfig,
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub repository: Arc<dyn RepositoryClient>,
    pub remote: Arc<dyn RemoteSync>,
    pub store: Arc<JobStore>,
    pub locks: Arc<LockRegistry>,
    pub notifier: Option<Arc<GotifyNotifier>>,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

struct PhaseTimer {
    phase: JobPhase,
    started_at: DateTime<Utc>,
}

impl PhaseTimer {
    fn start(phase: JobPhase) -> Self {
        Self {
            phase,
            started_at: Utc::now(),
        }
    }

    fn succeeded(self, detail: Option<String>) -> PhaseReport {
        PhaseReport {
            phase: self.phase,
            outcome: PhaseOutcome::Succeeded,
            started_at: self.started_at,
            finished_at: Utc::now(),
            error_class: None,
            exit_code: None,
            detail,
        }
    }

    fn failed(self, class: &str, exit_code: Option<i32>, detail: String) -> PhaseReport {
        PhaseReport {
            phase: self.phase,
            outcome: PhaseOutcome::Failed,
            started_at: self.started_at,
            finished_at: Utc::now(),
            error_class: Some(class.to_string()),
            exit_code,
            detail: Some(detail),
        }
    }
}

struct Progress {
    snapshot: Option<SnapshotHandle>,
    failure: Option<FailureReason>,
    degraded: bool,
}

/// Drives one job through the state machine. Whatever happens inside
/// `execute`, cleanup runs, the lock is released and the job reaches exactly
/// one terminal outcome.
pub(crate) async fn run(ctx: JobContext) {
    info!(job = %ctx.job_id, target = %ctx.target.name, "backup job started");
    let progress = execute(&ctx).await;
    cleanup(&ctx, progress.snapshot.as_ref()).await;

    let outcome = match (&progress.failure, progress.degraded) {
        (Some(_), _) => JobOutcome::Failed,
        (None, true) => JobOutcome::Partial,
        (None, false) => JobOutcome::Success,
    };
    let record = ctx.store.finish(ctx.job_id, outcome, progress.failure);

    match outcome {
        JobOutcome::Success => info!(job = %ctx.job_id, target = %ctx.target.name, "backup job succeeded"),
        JobOutcome::Partial => {
            warn!(job = %ctx.job_id, target = %ctx.target.name, "backup job finished with a failed optional phase")
        }
        JobOutcome::Failed => error!(job = %ctx.job_id, target = %ctx.target.name, "backup job failed"),
    }

    if let (Some(notifier), Some(record)) = (&ctx.notifier, &record) {
        notifier.notify_job(record).await;
    }
}

async fn execute(ctx: &JobContext) -> Progress {
    let mut progress = Progress {
        snapshot: None,
        failure: None,
        degraded: false,
    };

    // --- SnapshotCreating ---
    ctx.store.advance(ctx.job_id, JobPhase::SnapshotCreating);
    let timer = PhaseTimer::start(JobPhase::SnapshotCreating);
    let handle = match ctx.snapshots.create(&ctx.target.dataset, &ctx.cancel).await {
        Ok(handle) => {
            ctx.store.record_phase(
                ctx.job_id,
                timer.succeeded(Some(handle.snapshot_name.clone())),
            );
            handle
        }
        Err(err) => {
            warn!(job = %ctx.job_id, %err, "snapshot creation failed");
            ctx.store
                .record_phase(ctx.job_id, timer.failed(err.class(), None, err.to_string()));
            progress.failure = Some(match err {
                SnapshotError::Cancelled => FailureReason::Cancelled,
                _ => FailureReason::Snapshot,
            });
            record_skipped_from(ctx, JobPhase::RepoVerifying);
            return progress;
        }
    };
    progress.snapshot = Some(handle.clone());
    ctx.store.advance(ctx.job_id, JobPhase::SnapshotReady);

    // --- RepoBackingUp (idempotent init, then the backup itself) ---
    let repo = RepoAccess::from_target(&ctx.target);
    ctx.store.advance(ctx.job_id, JobPhase::RepoBackingUp);
    let timer = PhaseTimer::start(JobPhase::RepoBackingUp);

    if let Err(err) = ctx.repository.ensure_initialized(&repo, &ctx.cancel).await {
        warn!(job = %ctx.job_id, %err, "repository initialization failed");
        ctx.store.record_phase(
            ctx.job_id,
            timer.failed(err.class(), err.exit_code(), detail_for_repo(&err)),
        );
        progress.failure = Some(match err {
            RepoError::Cancelled => FailureReason::Cancelled,
            _ => FailureReason::Initialize,
        });
        record_skipped_from(ctx, JobPhase::RepoVerifying);
        return progress;
    }

    // Incremental parent: newest repository snapshot carrying this target's
    // tag. Nothing found is normal for a first backup.
    let parent = match ctx
        .repository
        .list_snapshots(&repo, Some(&ctx.target.name), &ctx.cancel)
        .await
    {
        Ok(snapshots) => newest_snapshot_id(&snapshots),
        Err(err) => {
            warn!(job = %ctx.job_id, %err, "could not determine parent snapshot");
            None
        }
    };
    if let Some(parent_id) = &parent {
        info!(job = %ctx.job_id, parent = %parent_id, "using incremental parent");
    }

    let tags = vec![ctx.target.name.clone(), handle.snapshot_name.clone()];
    match ctx
        .repository
        .backup(
            &repo,
            &handle.mount_point,
            &tags,
            parent.as_deref(),
            &ctx.cancel,
        )
        .await
    {
        Ok(report) => {
            ctx.store.record_phase(
                ctx.job_id,
                timer.succeeded(Some(format!(
                    "snapshot {}, {} bytes added, {} files changed",
                    report.snapshot_id, report.bytes_added, report.files_changed
                ))),
            );
        }
        Err(err) => {
            warn!(job = %ctx.job_id, %err, "backup failed");
            ctx.store.record_phase(
                ctx.job_id,
                timer.failed(err.class(), err.exit_code(), detail_for_repo(&err)),
            );
            progress.failure = Some(match err {
                RepoError::Cancelled => FailureReason::Cancelled,
                _ => FailureReason::Backup,
            });
            // A failed backup means nothing downstream has valid new data.
            record_skipped_from(ctx, JobPhase::RepoVerifying);
            return progress;
        }
    }

    // --- RepoVerifying (optional) ---
    if ctx.target.runs_check() {
        if ctx.cancel.is_cancelled() {
            progress.failure = Some(FailureReason::Cancelled);
            record_skipped_from(ctx, JobPhase::RepoVerifying);
            return progress;
        }
        ctx.store.advance(ctx.job_id, JobPhase::RepoVerifying);
        let timer = PhaseTimer::start(JobPhase::RepoVerifying);
        match ctx.repository.check(&repo, &ctx.cancel).await {
            Ok(()) => ctx.store.record_phase(ctx.job_id, timer.succeeded(None)),
            Err(RepoError::Cancelled) => {
                ctx.store.record_phase(
                    ctx.job_id,
                    timer.failed("cancelled", None, "cancelled".to_string()),
                );
                progress.failure = Some(FailureReason::Cancelled);
                record_skipped_from(ctx, JobPhase::RepoPruning);
                return progress;
            }
            Err(err) => {
                if matches!(err, RepoError::Integrity { .. }) {
                    error!(job = %ctx.job_id, %err, "repository integrity check failed");
                } else {
                    warn!(job = %ctx.job_id, %err, "repository check failed");
                }
                ctx.store.record_phase(
                    ctx.job_id,
                    timer.failed(err.class(), err.exit_code(), detail_for_repo(&err)),
                );
                progress.degraded = true;
            }
        }
    }

    // --- RepoPruning (optional) ---
    if ctx.target.runs_prune() {
        if ctx.cancel.is_cancelled() {
            progress.failure = Some(FailureReason::Cancelled);
            record_skipped_from(ctx, JobPhase::RepoPruning);
            return progress;
        }
        ctx.store.advance(ctx.job_id, JobPhase::RepoPruning);
        let timer = PhaseTimer::start(JobPhase::RepoPruning);
        match ctx
            .repository
            .prune(&repo, &ctx.target.retention, &ctx.cancel)
            .await
        {
            Ok(report) => ctx.store.record_phase(
                ctx.job_id,
                timer.succeeded(Some(format!("{} snapshots removed", report.removed_count))),
            ),
            Err(RepoError::Cancelled) => {
                ctx.store.record_phase(
                    ctx.job_id,
                    timer.failed("cancelled", None, "cancelled".to_string()),
                );
                progress.failure = Some(FailureReason::Cancelled);
                record_skipped_from(ctx, JobPhase::RemoteSyncing);
                return progress;
            }
            Err(err) => {
                warn!(job = %ctx.job_id, %err, "prune failed");
                ctx.store.record_phase(
                    ctx.job_id,
                    timer.failed(err.class(), err.exit_code(), detail_for_repo(&err)),
                );
                progress.degraded = true;
            }
        }
    }

    // --- RemoteSyncing (optional) ---
    if ctx.target.runs_sync() {
        if let Some(remote_dest) = ctx.target.remote.as_deref() {
            if ctx.cancel.is_cancelled() {
                progress.failure = Some(FailureReason::Cancelled);
                record_skipped_from(ctx, JobPhase::RemoteSyncing);
                return progress;
            }
            ctx.store.advance(ctx.job_id, JobPhase::RemoteSyncing);
            let timer = PhaseTimer::start(JobPhase::RemoteSyncing);
            match mirror_with_retry(ctx, Path::new(&ctx.target.repository), remote_dest).await {
                Ok(report) => ctx.store.record_phase(
                    ctx.job_id,
                    timer.succeeded(Some(format!(
                        "{} bytes transferred",
                        report.bytes_transferred
                    ))),
                ),
                Err(SyncError::Cancelled) => {
                    ctx.store.record_phase(
                        ctx.job_id,
                        timer.failed("cancelled", None, "cancelled".to_string()),
                    );
                    progress.failure = Some(FailureReason::Cancelled);
                    return progress;
                }
                Err(err) => {
                    // A failed mirror never demotes a successful local backup
                    // below Partial.
                    warn!(job = %ctx.job_id, %err, "remote sync failed after retries");
                    ctx.store.record_phase(
                        ctx.job_id,
                        timer.failed(err.class(), err.exit_code(), detail_for_sync(&err)),
                    );
                    progress.degraded = true;
                }
            }
        }
    }

    progress
}

/// Transient failures are retried with doubling delays; everything else is
/// final immediately. The backoff sleep aborts promptly on cancellation.
async fn mirror_with_retry(
    ctx: &JobContext,
    local: &Path,
    remote: &str,
) -> Result<SyncReport, SyncError> {
    let mut attempt = 1;
    loop {
        match ctx.remote.mirror(local, remote, &ctx.cancel).await {
            Ok(report) => return Ok(report),
            Err(err) if err.is_transient() && attempt < ctx.retry.sync_attempts => {
                let delay = ctx.retry.delay_for_attempt(attempt);
                warn!(
                    job = %ctx.job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %err,
                    "remote sync failed, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancel.cancelled() => return Err(SyncError::Cancelled),
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Always runs, regardless of the path taken to reach it: destroys the
/// snapshot (if one was created) and releases the target lock. Errors here
/// are warnings only; escalating them would mask the recorded root cause.
async fn cleanup(ctx: &JobContext, snapshot: Option<&SnapshotHandle>) {
    ctx.store.advance(ctx.job_id, JobPhase::CleaningUp);
    let timer = PhaseTimer::start(JobPhase::CleaningUp);
    let mut detail = None;
    if let Some(handle) = snapshot {
        if let Err(err) = ctx.snapshots.destroy(handle).await {
            warn!(job = %ctx.job_id, snapshot = %handle.snapshot_name, %err, "cleanup warning");
            detail = Some(format!("cleanup warning: {err}"));
        }
    }
    ctx.store.record_phase(ctx.job_id, timer.succeeded(detail));
    ctx.locks.release(&ctx.target.name);
}

/// Configured phases that will not run still show up in the report, so a
/// reader can tell "skipped" from "never configured".
fn record_skipped_from(ctx: &JobContext, from: JobPhase) {
    use JobPhase::*;
    let order = [
        (RepoVerifying, ctx.target.runs_check()),
        (RepoPruning, ctx.target.runs_prune()),
        (RemoteSyncing, ctx.target.runs_sync()),
    ];
    let mut reached = false;
    for (phase, enabled) in order {
        if phase == from {
            reached = true;
        }
        if reached && enabled {
            ctx.store.record_phase(ctx.job_id, PhaseReport::skipped(phase));
        }
    }
}

fn detail_for_repo(err: &RepoError) -> String {
    match err.stderr_tail() {
        Some(tail) if !tail.is_empty() => format!("{err}: {tail}"),
        _ => err.to_string(),
    }
}

fn detail_for_sync(err: &SyncError) -> String {
    match err.stderr_tail() {
        Some(tail) if !tail.is_empty() => format!("{err}: {tail}"),
        _ => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays_double_per_attempt() {
        let retry = RetryPolicy {
            sync_attempts: 4,
            sync_backoff_base: Duration::from_secs(5),
        };
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(20));
    }
}
