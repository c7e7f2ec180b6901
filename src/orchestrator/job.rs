// backuptool/src/orchestrator/job.rs
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

/// Phases of one orchestrated backup run. Every exit path is an explicit
/// transition; there is no implicit fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Accepted,
    SnapshotCreating,
    SnapshotReady,
    RepoBackingUp,
    RepoVerifying,
    RepoPruning,
    RemoteSyncing,
    CleaningUp,
    Terminal,
}

impl JobPhase {
    pub fn allowed_transitions(&self) -> &'static [JobPhase] {
        use JobPhase::*;
        match self {
            Accepted => &[SnapshotCreating],
            SnapshotCreating => &[SnapshotReady, CleaningUp],
            SnapshotReady => &[RepoBackingUp, CleaningUp],
            // Optional phases may each be disabled, so backing-up can jump
            // straight to any later phase or to cleanup.
            RepoBackingUp => &[RepoVerifying, RepoPruning, RemoteSyncing, CleaningUp],
            RepoVerifying => &[RepoPruning, RemoteSyncing, CleaningUp],
            RepoPruning => &[RemoteSyncing, CleaningUp],
            RemoteSyncing => &[CleaningUp],
            CleaningUp => &[Terminal],
            Terminal => &[],
        }
    }

    pub fn can_transition_to(self, target: JobPhase) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Terminal)
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Accepted => "accepted",
            Self::SnapshotCreating => "snapshot_creating",
            Self::SnapshotReady => "snapshot_ready",
            Self::RepoBackingUp => "repo_backing_up",
            Self::RepoVerifying => "repo_verifying",
            Self::RepoPruning => "repo_pruning",
            Self::RemoteSyncing => "remote_syncing",
            Self::CleaningUp => "cleaning_up",
            Self::Terminal => "terminal",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Backup and every configured optional phase succeeded.
    Success,
    /// Backup succeeded but at least one optional phase failed.
    Partial,
    /// The backup itself (or anything before it) failed, or the job was
    /// cancelled.
    Failed,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Snapshot,
    Initialize,
    Backup,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Record of one phase's execution, kept for diagnosis of partial failures.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: JobPhase,
    pub outcome: PhaseOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Classified error label (`network`, `repo-locked`, ...), never raw
    /// process output.
    pub error_class: Option<String>,
    /// Exit code of the underlying external process, when one failed.
    pub exit_code: Option<i32>,
    /// Supplementary diagnostic text (summary line or stderr tail).
    pub detail: Option<String>,
}

impl PhaseReport {
    pub fn skipped(phase: JobPhase) -> Self {
        let now = Utc::now();
        Self {
            phase,
            outcome: PhaseOutcome::Skipped,
            started_at: now,
            finished_at: now,
            error_class: None,
            exit_code: None,
            detail: None,
        }
    }
}

/// One orchestrated run for one target. Mutated only by the worker task
/// executing it; immutable once terminal.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub target: String,
    pub phase: JobPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<JobOutcome>,
    pub failure: Option<FailureReason>,
    pub phases: Vec<PhaseReport>,
}

impl JobRecord {
    pub fn new(id: Uuid, target: impl Into<String>) -> Self {
        Self {
            id,
            target: target.into(),
            phase: JobPhase::Accepted,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            failure: None,
            phases: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Moves the job to `next`, logging (but tolerating) an off-table
    /// transition so a bug here degrades to noise instead of a wedged job.
    pub fn advance(&mut self, next: JobPhase) {
        if !self.phase.can_transition_to(next) {
            warn!(job = %self.id, from = %self.phase, to = %next, "unexpected phase transition");
            debug_assert!(false, "unexpected transition {} -> {}", self.phase, next);
        }
        self.phase = next;
    }

    pub fn record_phase(&mut self, report: PhaseReport) {
        self.phases.push(report);
    }

    pub fn finish(&mut self, outcome: JobOutcome, failure: Option<FailureReason>) {
        self.advance(JobPhase::Terminal);
        self.outcome = Some(outcome);
        self.failure = failure;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions_are_allowed() {
        use JobPhase::*;
        let path = [
            Accepted,
            SnapshotCreating,
            SnapshotReady,
            RepoBackingUp,
            RepoVerifying,
            RepoPruning,
            RemoteSyncing,
            CleaningUp,
            Terminal,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_every_phase_failure_routes_through_cleanup() {
        use JobPhase::*;
        for phase in [
            SnapshotCreating,
            SnapshotReady,
            RepoBackingUp,
            RepoVerifying,
            RepoPruning,
            RemoteSyncing,
        ] {
            assert!(phase.can_transition_to(CleaningUp));
        }
    }

    #[test]
    fn test_optional_phases_can_be_bypassed() {
        use JobPhase::*;
        assert!(RepoBackingUp.can_transition_to(RemoteSyncing));
        assert!(RepoBackingUp.can_transition_to(CleaningUp));
        assert!(RepoVerifying.can_transition_to(RemoteSyncing));
    }

    #[test]
    fn test_forbidden_transitions() {
        use JobPhase::*;
        assert!(!Accepted.can_transition_to(RepoBackingUp));
        assert!(!CleaningUp.can_transition_to(RepoBackingUp));
        assert!(!RemoteSyncing.can_transition_to(RepoVerifying));
        assert!(Terminal.allowed_transitions().is_empty());
    }

    #[test]
    fn test_finish_makes_the_record_terminal() {
        let mut record = JobRecord::new(Uuid::new_v4(), "tank-data");
        record.advance(JobPhase::SnapshotCreating);
        record.advance(JobPhase::CleaningUp);
        record.finish(JobOutcome::Failed, Some(FailureReason::Snapshot));

        assert!(record.is_terminal());
        assert_eq!(record.outcome, Some(JobOutcome::Failed));
        assert_eq!(record.failure, Some(FailureReason::Snapshot));
        assert!(record.finished_at.is_some());
    }
}
