//! Helpers for running child processes with timeouts, cancellation, and bounded output.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// Captured child process outcome. Stdout is delivered line by line to the
/// caller instead of being buffered here.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stderr: Vec<u8>,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Run a command, feeding `stdin`, and hand each stdout line to `on_line` as it arrives.
///
/// The child is killed when `timeout` elapses or `cancel` fires; the returned
/// output reports which one happened. Stderr is drained concurrently and
/// bounded by `output_limit_bytes`. Spawn failures keep the underlying
/// `std::io::Error` so callers can downcast for `NotFound`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_command_streaming<F>(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancellationToken,
    mut on_line: F,
) -> Result<CommandOutput>
where
    F: FnMut(&str),
{
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).await.context("write stdin")?;
        child_stdin.shutdown().await.context("close stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stderr_handle =
        tokio::spawn(async move { read_stream_limited(stderr, output_limit_bytes).await });

    let mut lines = BufReader::new(stdout).lines();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut timed_out = false;
    let mut cancelled = false;
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("read stdout line")? {
                Some(line) => on_line(&line),
                None => break,
            },
            _ = &mut deadline => {
                timed_out = true;
                break;
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
        }
    }

    if timed_out || cancelled {
        warn!(
            timed_out,
            cancelled,
            timeout_secs = timeout.as_secs(),
            "stopping child process"
        );
        if let Err(e) = child.start_kill() {
            warn!(err = %e, "kill child process");
        }
    }

    let status = child.wait().await.context("wait for command")?;
    let (stderr, stderr_truncated) = match stderr_handle.await {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("stderr reader task panicked")),
    };

    if stderr_truncated > 0 {
        warn!(stderr_truncated, "stderr truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stderr,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
