//! External tool invocation.
//!
//! Output lines are logged as they arrive and only the last few are kept,
//! so a week-long capture does not buffer its whole log.

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::substrate::ActionError;

/// Lines of output kept for error messages and sentinel detection.
const TAIL_LINES: usize = 40;

/// How long to wait for output readers once the process has exited.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a stopped process gets to exit on its own before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

type Tail = Arc<Mutex<VecDeque<String>>>;

#[derive(Debug)]
pub struct CommandOutput {
    /// `None` if the exit status could not be read after a stop.
    pub status: Option<ExitStatus>,
    /// The process was killed because the stop future resolved.
    pub stopped: bool,
    pub duration: Duration,
    pub tail: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|status| status.success())
    }

    /// Case-insensitive search of the kept output.
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.tail
            .iter()
            .any(|line| line.to_lowercase().contains(&needle))
    }

    /// Error for a non-zero exit, carrying the last output lines.
    pub fn failure(&self, program: &str) -> ActionError {
        let code = self
            .status
            .and_then(|status| status.code())
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let start = self.tail.len().saturating_sub(5);
        ActionError::transient(format!(
            "{program} exited with {code}: {}",
            self.tail[start..].join(" | ")
        ))
    }
}

fn spawn_error(program: &str, err: std::io::Error) -> ActionError {
    match err.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            ActionError::permanent(format!("cannot run {program}: {err}"))
        }
        _ => ActionError::transient(format!("failed to spawn {program}: {err}")),
    }
}

fn forward_lines<R>(reader: R, program: String, stream: &'static str, tail: Tail) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.to_lowercase().contains("error") {
                warn!(program = %program, stream, "{line}");
            } else {
                debug!(program = %program, stream, "{line}");
            }
            let mut tail = tail.lock();
            if tail.len() >= TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

/// Interrupt the child so it can close its output, killing it if it is
/// still running after [`STOP_GRACE`].
async fn stop_child(program: &str, child: &mut Child) -> Option<ExitStatus> {
    if let Some(pid) = child.id() {
        let interrupted = tokio::task::spawn_blocking(move || process_utils::interrupt(pid))
            .await
            .unwrap_or(false);
        if interrupted {
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => return Some(status),
                Ok(Err(e)) => warn!(program, error = %e, "Waiting for interrupted command failed"),
                Err(_) => warn!(program, "Command ignored interrupt, killing it"),
            }
        }
    }
    if let Err(e) = child.start_kill() {
        warn!(program, error = %e, "Failed to kill command");
    }
    child.wait().await.ok()
}

/// Run `program` to completion.
///
/// Cancelling `cancel` returns [`ActionError::Cancelled`] and kills the
/// child. If `stop` resolves first, the child is interrupted (then killed
/// if it lingers) and the output is returned with `stopped` set.
pub async fn run_command(
    program: &str,
    args: &[String],
    cancel: &CancellationToken,
    stop: Option<BoxFuture<'_, ()>>,
) -> Result<CommandOutput, ActionError> {
    let started = Instant::now();
    let mut command = process_utils::tokio_command(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(program, ?args, "Spawning command");
    let mut child = command.spawn().map_err(|e| spawn_error(program, e))?;

    let tail: Tail = Arc::default();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(stdout, program.to_string(), "stdout", tail.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(stderr, program.to_string(), "stderr", tail.clone()));
    }

    let stop = stop.unwrap_or_else(|| std::future::pending().boxed());
    let (status, stopped) = tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| ActionError::transient(format!("waiting for {program}: {e}")))?;
            (Some(status), false)
        }
        _ = stop => {
            info!(program, "Stopping command");
            (stop_child(program, &mut child).await, true)
        }
        _ = cancel.cancelled() => {
            // Dropping the child kills it.
            return Err(ActionError::Cancelled);
        }
    };

    // A grandchild can keep the pipes open after the child exits.
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, join_all(readers))
        .await
        .is_err()
    {
        debug!(program, "Output readers did not finish");
    }

    let tail: Vec<String> = tail.lock().iter().cloned().collect();
    let output = CommandOutput {
        status,
        stopped,
        duration: started.elapsed(),
        tail,
    };
    debug!(
        program,
        success = output.success(),
        stopped,
        duration_secs = output.duration.as_secs_f64(),
        "Command finished"
    );
    Ok(output)
}

/// Run `program` and fail unless it exits successfully.
pub async fn run_checked(
    program: &str,
    args: &[String],
    cancel: &CancellationToken,
) -> Result<CommandOutput, ActionError> {
    let output = run_command(program, args, cancel, None).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(output.failure(program))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn keeps_output_tail() {
        let cancel = CancellationToken::new();
        let output = run_command("sh", &sh("echo one; echo two >&2"), &cancel, None)
            .await
            .unwrap();
        assert!(output.success());
        assert!(output.mentions("ONE"));
        assert!(output.mentions("two"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_transient() {
        let cancel = CancellationToken::new();
        let err = run_checked("sh", &sh("echo boom; exit 3"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn missing_program_is_permanent() {
        let cancel = CancellationToken::new();
        let err = run_checked("definitely-not-a-real-tool", &[], &cancel)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn stop_interrupts_long_running_process() {
        let cancel = CancellationToken::new();
        let stop = tokio::time::sleep(Duration::from_millis(50)).boxed();
        let output = run_command("sh", &sh("echo started; exec sleep 30"), &cancel, Some(stop))
            .await
            .unwrap();
        assert!(output.stopped);
        assert!(!output.success());
        assert!(output.duration < STOP_GRACE);
    }

    #[tokio::test]
    async fn stopped_process_can_finish_its_output() {
        let cancel = CancellationToken::new();
        let stop = tokio::time::sleep(Duration::from_millis(300)).boxed();
        let script = r#"trap 'echo flushed; exit 0' INT; echo started; while :; do sleep 0.05; done"#;
        let output = run_command("sh", &sh(script), &cancel, Some(stop))
            .await
            .unwrap();
        assert!(output.stopped);
        assert!(output.success());
        assert!(output.mentions("flushed"));
    }

    #[tokio::test]
    async fn output_readers_share_one_drain_timeout() {
        let cancel = CancellationToken::new();
        let stop = tokio::time::sleep(Duration::from_millis(50)).boxed();
        // The background sleep keeps both pipes open after the shell exits.
        let output = run_command("sh", &sh("sleep 30 & exec sleep 30"), &cancel, Some(stop))
            .await
            .unwrap();
        assert!(output.stopped);
        assert!(output.duration < READER_DRAIN_TIMEOUT + Duration::from_secs(3));
    }

    #[tokio::test]
    async fn cancel_returns_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = run_command("sh", &sh("sleep 30"), &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Cancelled));
    }
}
