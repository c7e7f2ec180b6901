// backuptool/src/repo/restic.rs
use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RetentionPolicy;
use crate::errors::RepoError;
use crate::repo::{BackupReport, PruneReport, RepoAccess, RepoSnapshot, RepositoryClient};
use crate::utils::process::{CommandOutput, run_command};

// Restic's documented exit codes; everything else is a generic process error.
const EXIT_SOURCE_ERRORS: i32 = 3;
const EXIT_NO_REPOSITORY: i32 = 10;
const EXIT_REPO_LOCKED: i32 = 11;
const EXIT_BAD_PASSWORD: i32 = 12;

fn network_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)connection (refused|reset)|i/o timeout|dial tcp|network is unreachable|no route to host|temporar(y|ily) (failure|unavailable)|tls handshake",
        )
        .expect("network pattern is valid")
    })
}

fn looks_like_network_failure(stderr: &str) -> bool {
    network_pattern().is_match(stderr)
}

/// Repository client backed by the `restic` binary. All progress and results
/// are consumed from restic's machine-readable `--json` output; free text is
/// only retained as diagnostic tails.
#[derive(Default)]
pub struct ResticRepository;

impl ResticRepository {
    pub fn new() -> Self {
        Self
    }

    async fn run_restic<I, S>(
        &self,
        repo: &RepoAccess,
        args: I,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RepoError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        Ok(run_command("restic", args, &repo.env(), cancel).await?)
    }

    fn classify_failure(output: &CommandOutput) -> RepoError {
        let stderr_tail = output.stderr_tail();
        match output.code {
            Some(EXIT_REPO_LOCKED) => RepoError::LockHeld { stderr_tail },
            Some(EXIT_BAD_PASSWORD) => RepoError::Credentials { stderr_tail },
            Some(EXIT_SOURCE_ERRORS) => RepoError::SourceUnreadable { stderr_tail },
            _ if looks_like_network_failure(&output.stderr) => RepoError::Network { stderr_tail },
            code => RepoError::Process { code, stderr_tail },
        }
    }
}

/// Final summary message of `restic backup --json`.
#[derive(Debug, Deserialize)]
struct BackupSummary {
    snapshot_id: String,
    #[serde(default)]
    data_added: u64,
    #[serde(default)]
    files_changed: u64,
}

/// One group in the JSON output of `restic forget`.
#[derive(Debug, Deserialize)]
struct ForgetGroup {
    #[serde(default)]
    remove: Option<Vec<serde_json::Value>>,
}

fn parse_backup_summary(stdout: &str) -> Result<BackupReport, RepoError> {
    for line in stdout.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if value.get("message_type").and_then(|v| v.as_str()) != Some("summary") {
            continue;
        }
        let summary: BackupSummary = serde_json::from_value(value)
            .map_err(|err| RepoError::Output(format!("bad backup summary: {err}")))?;
        return Ok(BackupReport {
            snapshot_id: summary.snapshot_id,
            bytes_added: summary.data_added,
            files_changed: summary.files_changed,
        });
    }
    Err(RepoError::Output(
        "backup finished without a summary message".to_string(),
    ))
}

/// `restic forget --json` prints the forget groups as one JSON document,
/// possibly followed by prune progress lines. Count removed snapshots; a
/// missing document only costs us the count, not the run.
fn parse_removed_count(stdout: &str) -> Option<u64> {
    for line in stdout.lines() {
        let line = line.trim();
        if !line.starts_with('[') {
            continue;
        }
        if let Ok(groups) = serde_json::from_str::<Vec<ForgetGroup>>(line) {
            let removed = groups
                .iter()
                .map(|g| g.remove.as_ref().map_or(0, |r| r.len() as u64))
                .sum();
            return Some(removed);
        }
    }
    None
}

#[async_trait]
impl RepositoryClient for ResticRepository {
    async fn ensure_initialized(
        &self,
        repo: &RepoAccess,
        cancel: &CancellationToken,
    ) -> Result<(), RepoError> {
        // Probe first so an existing repository is never touched.
        let probe = self.run_restic(repo, ["cat", "config"], cancel).await?;
        if probe.success() {
            return Ok(());
        }
        if probe.code != Some(EXIT_NO_REPOSITORY) {
            return Err(Self::classify_failure(&probe));
        }

        info!(repository = %repo.repository, "repository not found, initializing");
        let init = self.run_restic(repo, ["init"], cancel).await?;
        if !init.success() {
            return Err(Self::classify_failure(&init));
        }
        Ok(())
    }

    async fn backup(
        &self,
        repo: &RepoAccess,
        source: &Path,
        tags: &[String],
        parent: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BackupReport, RepoError> {
        let mut args = vec!["--json".to_string(), "backup".to_string()];
        for tag in tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        if let Some(parent_id) = parent {
            args.push("--parent".to_string());
            args.push(parent_id.to_string());
        }
        args.push(source.to_string_lossy().to_string());

        let output = self.run_restic(repo, args, cancel).await?;
        if !output.success() {
            return Err(Self::classify_failure(&output));
        }
        parse_backup_summary(&output.stdout)
    }

    async fn check(&self, repo: &RepoAccess, cancel: &CancellationToken) -> Result<(), RepoError> {
        let output = self.run_restic(repo, ["check"], cancel).await?;
        if output.success() {
            return Ok(());
        }
        // A plain failure from `check` means restic found structural
        // problems; infrastructure failures keep their own classes.
        Err(match Self::classify_failure(&output) {
            RepoError::Process { code: Some(1), .. } => RepoError::Integrity {
                stderr_tail: output.stderr_tail(),
            },
            other => other,
        })
    }

    async fn prune(
        &self,
        repo: &RepoAccess,
        retention: &RetentionPolicy,
        cancel: &CancellationToken,
    ) -> Result<PruneReport, RepoError> {
        let mut args = vec![
            "--json".to_string(),
            "forget".to_string(),
            "--prune".to_string(),
            "--group-by".to_string(),
            "paths".to_string(),
        ];
        args.extend(retention.to_forget_args());

        let output = self.run_restic(repo, args, cancel).await?;
        if !output.success() {
            return Err(Self::classify_failure(&output));
        }

        let removed_count = parse_removed_count(&output.stdout).unwrap_or_else(|| {
            warn!(repository = %repo.repository, "forget output had no parsable group document");
            0
        });
        Ok(PruneReport { removed_count })
    }

    async fn list_snapshots(
        &self,
        repo: &RepoAccess,
        tag: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RepoSnapshot>, RepoError> {
        let mut args = vec!["snapshots".to_string(), "--json".to_string()];
        if let Some(tag) = tag {
            args.push("--tag".to_string());
            args.push(tag.to_string());
        }

        let output = self.run_restic(repo, args, cancel).await?;
        if !output.success() {
            return Err(Self::classify_failure(&output));
        }
        serde_json::from_str(&output.stdout)
            .map_err(|err| RepoError::Output(format!("bad snapshot listing: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn output(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_exit_codes_map_to_error_classes() {
        assert!(matches!(
            ResticRepository::classify_failure(&output(EXIT_REPO_LOCKED, "repo already locked")),
            RepoError::LockHeld { .. }
        ));
        assert!(matches!(
            ResticRepository::classify_failure(&output(EXIT_BAD_PASSWORD, "wrong password")),
            RepoError::Credentials { .. }
        ));
        assert!(matches!(
            ResticRepository::classify_failure(&output(EXIT_SOURCE_ERRORS, "read error")),
            RepoError::SourceUnreadable { .. }
        ));
        assert!(matches!(
            ResticRepository::classify_failure(&output(1, "something broke")),
            RepoError::Process { code: Some(1), .. }
        ));
    }

    #[test]
    fn test_network_stderr_beats_generic_process_error() {
        let err = ResticRepository::classify_failure(&output(
            1,
            "Fatal: unable to open repository: dial tcp 10.0.0.1:8000: i/o timeout",
        ));
        assert!(matches!(err, RepoError::Network { .. }));
    }

    #[test]
    fn test_parse_backup_summary_from_json_stream() -> anyhow::Result<()> {
        let stdout = concat!(
            r#"{"message_type":"status","percent_done":0.5}"#,
            "\n",
            r#"{"message_type":"status","percent_done":1.0}"#,
            "\n",
            r#"{"message_type":"summary","snapshot_id":"a1b2c3d4","data_added":4096,"files_changed":3,"files_new":1}"#,
            "\n",
        );
        let report = parse_backup_summary(stdout)?;
        assert_eq!(report.snapshot_id, "a1b2c3d4");
        assert_eq!(report.bytes_added, 4096);
        assert_eq!(report.files_changed, 3);
        Ok(())
    }

    #[test]
    fn test_missing_summary_is_an_output_error() {
        let err = parse_backup_summary(r#"{"message_type":"status","percent_done":1.0}"#)
            .unwrap_err();
        assert!(matches!(err, RepoError::Output(_)));
    }

    #[test]
    fn test_parse_removed_count_from_forget_groups() {
        let stdout = r#"[{"keep":[{"short_id":"aa"}],"remove":[{"short_id":"bb"},{"short_id":"cc"}]},{"remove":null}]"#;
        assert_eq!(parse_removed_count(stdout), Some(2));
        assert_eq!(parse_removed_count("unparsable"), None);
    }

    #[test]
    fn test_repo_access_env_carries_credentials_reference() {
        let repo = RepoAccess {
            repository: "/srv/restic/tank".to_string(),
            password_file: PathBuf::from("/config/restic.pass"),
        };
        let env = repo.env();
        assert!(env.contains(&(
            "RESTIC_REPOSITORY".to_string(),
            "/srv/restic/tank".to_string()
        )));
        assert!(env.contains(&(
            "RESTIC_PASSWORD_FILE".to_string(),
            "/config/restic.pass".to_string()
        )));
    }
}
