// backuptool/src/utils/process.rs
use std::ffi::OsStr;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::CommandError;

const STDERR_TAIL_LINES: usize = 20;

/// Captured result of an external command. A non-zero exit is represented
/// here rather than as an error so callers can map exit codes themselves.
#[derive(Debug)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Bounded stderr excerpt suitable for diagnostics in job reports.
    pub fn stderr_tail(&self) -> String {
        tail_lines(&self.stderr, STDERR_TAIL_LINES)
    }
}

/// Last `n` lines of `text`, joined with newlines.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Runs `program` with `args` and extra `envs`, capturing stdout and stderr.
///
/// The call suspends until the process exits; this does not block other
/// workers. If `cancel` fires first the child is killed and
/// `CommandError::Cancelled` is returned.
pub async fn run_command<I, S>(
    program: &str,
    args: I,
    envs: &[(String, String)],
    cancel: &CancellationToken,
) -> Result<CommandOutput, CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| CommandError::Launch {
        program: program.to_string(),
        source,
    })?;

    // Drain both pipes concurrently with the wait so a chatty child cannot
    // deadlock on a full pipe buffer.
    let mut stdout_pipe = child.stdout.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let mut stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let status = tokio::select! {
        status = child.wait() => status.map_err(|source| CommandError::Launch {
            program: program.to_string(),
            source,
        })?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            debug!(program, "external command killed on cancellation");
            return Err(CommandError::Cancelled {
                program: program.to_string(),
            });
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let output = CommandOutput {
        code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    };
    debug!(program, code = ?output.code, "external command finished");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tail_lines_shorter_than_limit() {
        assert_eq!(tail_lines("a\nb", 5), "a\nb");
    }

    #[test]
    fn test_tail_lines_truncates_from_the_front() {
        let text = "1\n2\n3\n4\n5";
        assert_eq!(tail_lines(text, 2), "4\n5");
    }

    #[tokio::test]
    async fn test_run_command_captures_streams_and_exit_code() -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let output = run_command(
            "sh",
            ["-c", "echo out; echo err >&2; exit 3"],
            &[],
            &cancel,
        )
        .await?;

        assert_eq!(output.code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        Ok(())
    }

    #[tokio::test]
    async fn test_run_command_passes_extra_env() -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let envs = vec![("BACKUPTOOL_TEST_VAR".to_string(), "hello".to_string())];
        let output = run_command("sh", ["-c", "printf '%s' \"$BACKUPTOOL_TEST_VAR\""], &envs, &cancel).await?;

        assert!(output.success());
        assert_eq!(output.stdout, "hello");
        Ok(())
    }

    #[tokio::test]
    async fn test_run_command_cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let child_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_command("sleep", ["30"], &[], &child_cancel).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cancelled command did not return promptly")
            .expect("task panicked");
        assert!(matches!(result, Err(CommandError::Cancelled { .. })));
    }
}
