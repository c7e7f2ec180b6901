// backuptool/src/snapshot/zfs.rs
use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Local;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::SnapshotError;
use crate::snapshot::{SnapshotHandle, SnapshotProvider};
use crate::utils::process::{CommandOutput, run_command};

/// Snapshot provider backed by the `zfs` and `mount`/`umount` binaries.
///
/// Outstanding handles are tracked in-process so that a destroy arriving from
/// a crash-recovery cleanup path after the handle is already gone degrades to
/// a logged warning instead of a hard failure.
pub struct ZfsSnapshots {
    mount_root: PathBuf,
    outstanding: Mutex<HashSet<Uuid>>,
}

impl ZfsSnapshots {
    pub fn new(mount_root: PathBuf) -> Self {
        Self {
            mount_root,
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    fn mount_point_for(&self, dataset: &str) -> PathBuf {
        let safe_dataset = dataset.replace('/', "_");
        self.mount_root.join(format!("backuptool_{safe_dataset}"))
    }

    fn snapshot_name_for(dataset: &str) -> String {
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        format!("{dataset}@backuptool-{stamp}")
    }

    fn classify_create_failure(dataset: &str, output: &CommandOutput) -> SnapshotError {
        if output.stderr.contains("does not exist") {
            SnapshotError::SourceMissing(dataset.to_string())
        } else {
            SnapshotError::Command {
                step: "zfs snapshot",
                code: output.code,
                stderr: output.stderr_tail(),
            }
        }
    }

    /// Best-effort rollback of a half-created snapshot. Never escalates; the
    /// caller is already returning the original error.
    async fn rollback_create(&self, snapshot_name: &str, mount_point: &PathBuf) {
        let cancel = CancellationToken::new();
        match run_command("zfs", ["destroy", "-r", snapshot_name], &[], &cancel).await {
            Ok(output) if !output.success() => {
                warn!(snapshot = snapshot_name, stderr = %output.stderr_tail(), "rollback: zfs destroy failed");
            }
            Err(err) => warn!(snapshot = snapshot_name, %err, "rollback: could not run zfs destroy"),
            Ok(_) => {}
        }
        if let Err(err) = tokio::fs::remove_dir(mount_point).await {
            warn!(path = %mount_point.display(), %err, "rollback: could not remove mount point");
        }
    }
}

#[async_trait]
impl SnapshotProvider for ZfsSnapshots {
    async fn create(
        &self,
        dataset: &str,
        cancel: &CancellationToken,
    ) -> Result<SnapshotHandle, SnapshotError> {
        let snapshot_name = Self::snapshot_name_for(dataset);
        let mount_point = self.mount_point_for(dataset);

        let output = run_command("zfs", ["snapshot", "-r", &snapshot_name], &[], cancel).await?;
        if !output.success() {
            return Err(Self::classify_create_failure(dataset, &output));
        }

        if let Err(source) = tokio::fs::create_dir_all(&mount_point).await {
            self.rollback_create(&snapshot_name, &mount_point).await;
            return Err(SnapshotError::MountPoint {
                path: mount_point,
                source,
            });
        }

        let mount_point_str = mount_point.to_string_lossy().to_string();
        let mount_args = ["-t", "zfs", snapshot_name.as_str(), mount_point_str.as_str()];
        let output = match run_command("mount", mount_args, &[], cancel).await {
            Ok(output) => output,
            Err(err) => {
                self.rollback_create(&snapshot_name, &mount_point).await;
                return Err(err.into());
            }
        };
        if !output.success() {
            self.rollback_create(&snapshot_name, &mount_point).await;
            return Err(SnapshotError::Command {
                step: "mount",
                code: output.code,
                stderr: output.stderr_tail(),
            });
        }

        let handle = SnapshotHandle {
            id: Uuid::new_v4(),
            dataset: dataset.to_string(),
            snapshot_name,
            mount_point,
        };
        self.outstanding.lock().insert(handle.id);
        info!(dataset, snapshot = %handle.snapshot_name, mount = %handle.mount_point.display(), "snapshot created");
        Ok(handle)
    }

    async fn destroy(&self, handle: &SnapshotHandle) -> Result<(), SnapshotError> {
        if !self.outstanding.lock().remove(&handle.id) {
            // Common during crash-recovery cleanup; never fatal.
            warn!(snapshot = %handle.snapshot_name, "destroy called for a handle that is no longer outstanding");
            return Ok(());
        }

        // Cleanup is not cancellable: run every step, remember the first
        // failure, report it to the caller for warn-level logging.
        let cancel = CancellationToken::new();
        let mut first_error: Option<SnapshotError> = None;

        let mount_point = handle.mount_point.to_string_lossy().to_string();
        match run_command("umount", [mount_point.as_str()], &[], &cancel).await {
            Ok(output) if !output.success() => {
                warn!(snapshot = %handle.snapshot_name, stderr = %output.stderr_tail(), "umount failed");
                first_error.get_or_insert(SnapshotError::Command {
                    step: "umount",
                    code: output.code,
                    stderr: output.stderr_tail(),
                });
            }
            Err(err) => {
                first_error.get_or_insert(err.into());
            }
            Ok(_) => {}
        }

        match run_command(
            "zfs",
            ["destroy", "-r", handle.snapshot_name.as_str()],
            &[],
            &cancel,
        )
        .await
        {
            Ok(output) if !output.success() => {
                warn!(snapshot = %handle.snapshot_name, stderr = %output.stderr_tail(), "zfs destroy failed");
                first_error.get_or_insert(SnapshotError::Command {
                    step: "zfs destroy",
                    code: output.code,
                    stderr: output.stderr_tail(),
                });
            }
            Err(err) => {
                first_error.get_or_insert(err.into());
            }
            Ok(_) => {}
        }

        if let Err(err) = tokio::fs::remove_dir(&handle.mount_point).await {
            warn!(path = %handle.mount_point.display(), %err, "could not remove mount point");
            first_error.get_or_insert(SnapshotError::MountPoint {
                path: handle.mount_point.clone(),
                source: err,
            });
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(snapshot = %handle.snapshot_name, "snapshot destroyed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ZfsSnapshots {
        ZfsSnapshots::new(PathBuf::from("/mnt"))
    }

    #[test]
    fn test_mount_point_replaces_dataset_separators() {
        let provider = provider();
        assert_eq!(
            provider.mount_point_for("tank/data/home"),
            PathBuf::from("/mnt/backuptool_tank_data_home")
        );
    }

    #[test]
    fn test_snapshot_name_is_qualified_with_dataset() {
        let name = ZfsSnapshots::snapshot_name_for("tank/data");
        assert!(name.starts_with("tank/data@backuptool-"));
    }

    #[test]
    fn test_missing_dataset_classified_as_source_missing() {
        let output = CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "cannot open 'tank/nope': dataset does not exist".to_string(),
        };
        let err = ZfsSnapshots::classify_create_failure("tank/nope", &output);
        assert!(matches!(err, SnapshotError::SourceMissing(ref d) if d == "tank/nope"));
    }

    #[tokio::test]
    async fn test_destroy_unknown_handle_is_a_noop() -> anyhow::Result<()> {
        let provider = provider();
        let handle = SnapshotHandle {
            id: Uuid::new_v4(),
            dataset: "tank/data".to_string(),
            snapshot_name: "tank/data@backuptool-x".to_string(),
            mount_point: PathBuf::from("/mnt/backuptool_tank_data"),
        };

        // Never created through this provider, so destroy must not attempt
        // any external command and must not fail.
        provider.destroy(&handle).await?;
        provider.destroy(&handle).await?;
        Ok(())
    }
}
