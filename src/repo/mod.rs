pub(crate) mod restic;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{RetentionPolicy, TargetConfig};
use crate::errors::RepoError;

pub use restic::ResticRepository;

/// Access coordinates for one repository. Credentials travel as a password
/// file reference, handed to the backup tool through its environment.
#[derive(Debug, Clone)]
pub struct RepoAccess {
    pub repository: String,
    pub password_file: PathBuf,
}

impl RepoAccess {
    pub fn from_target(target: &TargetConfig) -> Self {
        Self {
            repository: target.repository.clone(),
            password_file: target.password_file.clone(),
        }
    }

    pub(crate) fn env(&self) -> Vec<(String, String)> {
        vec![
            ("RESTIC_REPOSITORY".to_string(), self.repository.clone()),
            (
                "RESTIC_PASSWORD_FILE".to_string(),
                self.password_file.to_string_lossy().to_string(),
            ),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub snapshot_id: String,
    pub bytes_added: u64,
    pub files_changed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed_count: u64,
}

/// One repository snapshot as reported by the backup tool's JSON listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSnapshot {
    pub id: String,
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Newest snapshot in a listing; used for incremental parent selection.
pub fn newest_snapshot_id(snapshots: &[RepoSnapshot]) -> Option<String> {
    snapshots
        .iter()
        .max_by_key(|s| s.time)
        .map(|s| s.short_id.clone())
}

/// Capability interface over the content-addressed backup engine.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Safe to call every run: succeeds without side effects when the
    /// repository already exists.
    async fn ensure_initialized(
        &self,
        repo: &RepoAccess,
        cancel: &CancellationToken,
    ) -> Result<(), RepoError>;

    async fn backup(
        &self,
        repo: &RepoAccess,
        source: &Path,
        tags: &[String],
        parent: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BackupReport, RepoError>;

    async fn check(&self, repo: &RepoAccess, cancel: &CancellationToken) -> Result<(), RepoError>;

    async fn prune(
        &self,
        repo: &RepoAccess,
        retention: &RetentionPolicy,
        cancel: &CancellationToken,
    ) -> Result<PruneReport, RepoError>;

    async fn list_snapshots(
        &self,
        repo: &RepoAccess,
        tag: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RepoSnapshot>, RepoError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot(short_id: &str, hour: u32) -> RepoSnapshot {
        RepoSnapshot {
            id: format!("{short_id}-full"),
            short_id: short_id.to_string(),
            time: Utc.with_ymd_and_hms(2026, 8, 1, hour, 0, 0).unwrap(),
            tags: vec![],
            paths: vec![],
        }
    }

    #[test]
    fn test_newest_snapshot_wins_regardless_of_order() {
        let snapshots = vec![snapshot("bbb", 12), snapshot("ccc", 18), snapshot("aaa", 6)];
        assert_eq!(newest_snapshot_id(&snapshots), Some("ccc".to_string()));
    }

    #[test]
    fn test_newest_snapshot_of_empty_listing_is_none() {
        assert_eq!(newest_snapshot_id(&[]), None);
    }
}
