use thiserror::Error;
use uuid::Uuid;

/// Failure launching or supervising an external process. Non-zero exit codes
/// are not an error at this layer; adapters classify them themselves.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} was cancelled before it finished")]
    Cancelled { program: String },
}

/// Classified failure from the snapshot provider.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("source dataset does not exist: {0}")]
    SourceMissing(String),

    #[error("{step} failed with status {code:?}: {stderr}")]
    Command {
        step: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to prepare mount point {}: {source}", path.display())]
    MountPoint {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Exec(CommandError),
}

impl From<CommandError> for SnapshotError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Cancelled { .. } => SnapshotError::Cancelled,
            other => SnapshotError::Exec(other),
        }
    }
}

impl SnapshotError {
    /// Short machine-readable class label carried into job reports.
    pub fn class(&self) -> &'static str {
        match self {
            SnapshotError::SourceMissing(_) => "source-missing",
            SnapshotError::Command { .. } => "command",
            SnapshotError::MountPoint { .. } => "mount-point",
            SnapshotError::Cancelled => "cancelled",
            SnapshotError::Exec(_) => "exec",
        }
    }
}

/// Classified failure from the repository client. The orchestrator decides
/// whether a given class aborts the job or only downgrades the outcome.
#[derive(Error, Debug)]
pub enum RepoError {
    /// Another process holds the repository lock. Possibly a stale lock from
    /// a crashed run; never broken automatically, surfaced for an operator.
    #[error("repository is locked by another process")]
    LockHeld { stderr_tail: String },

    #[error("backup source is unreadable")]
    SourceUnreadable { stderr_tail: String },

    #[error("network failure talking to the repository")]
    Network { stderr_tail: String },

    #[error("repository credentials were rejected")]
    Credentials { stderr_tail: String },

    /// Structural corruption reported by the integrity check. Non-retryable
    /// and reported with the highest severity.
    #[error("repository integrity check failed")]
    Integrity { stderr_tail: String },

    #[error("restic exited with status {code:?}")]
    Process {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("unexpected restic output: {0}")]
    Output(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Exec(CommandError),
}

impl From<CommandError> for RepoError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Cancelled { .. } => RepoError::Cancelled,
            other => RepoError::Exec(other),
        }
    }
}

impl RepoError {
    /// Short machine-readable class label carried into job reports.
    pub fn class(&self) -> &'static str {
        match self {
            RepoError::LockHeld { .. } => "repo-locked",
            RepoError::SourceUnreadable { .. } => "source-unreadable",
            RepoError::Network { .. } => "network",
            RepoError::Credentials { .. } => "credentials",
            RepoError::Integrity { .. } => "integrity",
            RepoError::Process { .. } => "process",
            RepoError::Output(_) => "output",
            RepoError::Cancelled => "cancelled",
            RepoError::Exec(_) => "exec",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RepoError::Process { code, .. } => *code,
            _ => None,
        }
    }

    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            RepoError::LockHeld { stderr_tail }
            | RepoError::SourceUnreadable { stderr_tail }
            | RepoError::Network { stderr_tail }
            | RepoError::Credentials { stderr_tail }
            | RepoError::Integrity { stderr_tail }
            | RepoError::Process { stderr_tail, .. } => Some(stderr_tail),
            _ => None,
        }
    }
}

/// Classified failure from the remote sync adapter.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("network failure while mirroring to remote")]
    Network { stderr_tail: String },

    #[error("remote rejected our credentials")]
    Auth { stderr_tail: String },

    #[error("rclone exited with status {code:?}")]
    Process {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Exec(CommandError),
}

impl From<CommandError> for SyncError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Cancelled { .. } => SyncError::Cancelled,
            other => SyncError::Exec(other),
        }
    }
}

impl SyncError {
    /// Only network-class failures are worth retrying; auth and process
    /// failures will not heal on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network { .. })
    }

    pub fn class(&self) -> &'static str {
        match self {
            SyncError::Network { .. } => "network",
            SyncError::Auth { .. } => "auth",
            SyncError::Process { .. } => "process",
            SyncError::Cancelled => "cancelled",
            SyncError::Exec(_) => "exec",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SyncError::Process { code, .. } => *code,
            _ => None,
        }
    }

    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            SyncError::Network { stderr_tail }
            | SyncError::Auth { stderr_tail }
            | SyncError::Process { stderr_tail, .. } => Some(stderr_tail),
            _ => None,
        }
    }
}

/// Rejection of a trigger request before any job exists.
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("target {target} is busy: job {held_by} is still running")]
    TargetBusy { target: String, held_by: Uuid },

    #[error("unknown target: {0}")]
    UnknownTarget(String),
}
