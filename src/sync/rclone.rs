// backuptool/src/sync/rclone.rs
use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::SyncError;
use crate::sync::{RemoteSync, SyncReport};
use crate::utils::process::{CommandOutput, run_command};

// rclone exits 5 when its own retries of a temporary (network-class) error
// were exhausted.
const EXIT_TEMPORARY_ERROR: i32 = 5;

fn auth_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\b401\b|\b403\b|unauthorized|forbidden|authentication|access denied|permission denied|invalid credentials|bad credential|signature",
        )
        .expect("auth pattern is valid")
    })
}

fn network_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)connection (refused|reset)|i/o timeout|dial tcp|network is unreachable|no route to host|temporar(y|ily) (failure|unavailable)|tls handshake|broken pipe",
        )
        .expect("network pattern is valid")
    })
}

/// Remote sync adapter backed by the `rclone` binary. `rclone sync` is
/// incremental: files already present on the remote are skipped, so a retry
/// after a partial transfer resumes instead of starting over.
#[derive(Default)]
pub struct RcloneSync;

impl RcloneSync {
    pub fn new() -> Self {
        Self
    }

    fn classify_failure(output: &CommandOutput) -> SyncError {
        let stderr_tail = output.stderr_tail();
        if auth_pattern().is_match(&output.stderr) {
            SyncError::Auth { stderr_tail }
        } else if output.code == Some(EXIT_TEMPORARY_ERROR)
            || network_pattern().is_match(&output.stderr)
        {
            SyncError::Network { stderr_tail }
        } else {
            SyncError::Process {
                code: output.code,
                stderr_tail,
            }
        }
    }
}

/// With `--use-json-log -v` rclone emits JSON lines on stderr; the final
/// stats record carries the transferred byte count.
fn parse_bytes_transferred(stderr: &str) -> Option<u64> {
    for line in stderr.lines().rev() {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            continue;
        };
        if let Some(bytes) = value
            .get("stats")
            .and_then(|stats| stats.get("bytes"))
            .and_then(|bytes| bytes.as_u64())
        {
            return Some(bytes);
        }
    }
    None
}

#[async_trait]
impl RemoteSync for RcloneSync {
    async fn mirror(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let local = local.to_string_lossy().to_string();
        let args = [
            "sync",
            "--use-json-log",
            "-v",
            local.as_str(),
            remote,
        ];

        let output = run_command("rclone", args, &[], cancel).await?;
        if !output.success() {
            return Err(Self::classify_failure(&output));
        }

        let bytes_transferred = parse_bytes_transferred(&output.stderr).unwrap_or_else(|| {
            warn!(remote, "rclone finished without a parsable stats record");
            0
        });
        info!(remote, bytes_transferred, "remote mirror finished");
        Ok(SyncReport { bytes_transferred })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_auth_failures_classified_before_anything_else() {
        let err = RcloneSync::classify_failure(&output(
            EXIT_TEMPORARY_ERROR,
            "Failed to copy: 403 Forbidden: authentication required",
        ));
        assert!(matches!(err, SyncError::Auth { .. }));
    }

    #[test]
    fn test_temporary_error_exit_code_is_network_class() {
        let err = RcloneSync::classify_failure(&output(EXIT_TEMPORARY_ERROR, "retries exhausted"));
        assert!(matches!(err, SyncError::Network { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_network_stderr_is_network_class() {
        let err = RcloneSync::classify_failure(&output(
            1,
            "Failed to sync: dial tcp 198.51.100.7:443: connection refused",
        ));
        assert!(matches!(err, SyncError::Network { .. }));
    }

    #[test]
    fn test_other_failures_keep_their_exit_code() {
        let err = RcloneSync::classify_failure(&output(7, "fatal error"));
        assert!(matches!(err, SyncError::Process { code: Some(7), .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_bytes_taken_from_final_stats_record() {
        let stderr = concat!(
            r#"{"level":"info","msg":"Copied (new)","object":"pack1"}"#,
            "\n",
            r#"{"level":"info","msg":"…","stats":{"bytes":1024,"errors":0}}"#,
            "\n",
            r#"{"level":"info","msg":"done","stats":{"bytes":409600,"errors":0}}"#,
            "\n",
        );
        assert_eq!(parse_bytes_transferred(stderr), Some(409600));
        assert_eq!(parse_bytes_transferred("plain text output"), None);
    }
}
