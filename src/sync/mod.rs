pub(crate) mod rclone;

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::errors::SyncError;

pub use rclone::RcloneSync;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub bytes_transferred: u64,
}

/// Capability interface over the remote-mirroring engine: one-way incremental
/// copy of a local path to off-host storage. A retried mirror resumes where
/// the previous attempt stopped; that is a property of the underlying tool
/// and is exposed transparently here.
#[async_trait]
pub trait RemoteSync: Send + Sync {
    async fn mirror(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError>;
}
