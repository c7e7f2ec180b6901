pub(crate) mod zfs;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::SnapshotError;

pub use zfs::ZfsSnapshots;

/// Handle to a point-in-time, read-only view of a dataset. Owned exclusively
/// by the job that created it; destroyed exactly once on every exit path.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    pub id: Uuid,
    pub dataset: String,
    /// Fully qualified snapshot name, e.g. `tank/data@backuptool-...`.
    pub snapshot_name: String,
    /// Where the snapshot is mounted for the backup tool to read.
    pub mount_point: PathBuf,
}

/// Capability interface for creating and destroying consistent views of a
/// source dataset.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn create(
        &self,
        dataset: &str,
        cancel: &CancellationToken,
    ) -> Result<SnapshotHandle, SnapshotError>;

    /// Tears the snapshot down. Deliberately not cancellable: cleanup runs to
    /// completion even when the owning job is being cancelled. Destroying a
    /// handle twice is a warn-level no-op.
    async fn destroy(&self, handle: &SnapshotHandle) -> Result<(), SnapshotError>;
}
