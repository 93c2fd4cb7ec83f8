use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Configuration for spawning a child process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub log_prefix: String,
    pub env: Vec<(String, String)>,
    pub stdin_data: Option<String>,
}

/// Output from a completed child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
}

/// Spawn a child process, stream its output line-by-line, and wait for it.
///
/// The child is placed in its own process group on Unix. Cancelling the
/// token or exceeding the timeout kills the whole group and returns an
/// error; the caller decides how that failure is represented.
pub async fn spawn_and_stream(
    config: ProcessConfig,
    cancel: &CancellationToken,
) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd.stdin(if config.stdin_data.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", config.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Process("child has no pid".into()))?;

    if let Some(data) = config.stdin_data
        && let Some(mut stdin) = child.stdin.take()
    {
        // Write from a task so a large prompt cannot deadlock against
        // an already-chatty child.
        tokio::spawn(async move {
            let _ = stdin.write_all(data.as_bytes()).await;
        });
    }

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");

    let prefix_out = config.log_prefix.clone();
    let prefix_err = config.log_prefix;

    let stdout_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            info!("[{prefix_out}] {line}");
            lines.push(line);
        }
        lines
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            warn!("[{prefix_err}] {line}");
            lines.push(line);
        }
        lines
    });

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            terminate_group(pid).await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(Error::Process(format!("'{}' cancelled", config.command)));
        }
        res = wait_with_timeout(&mut child, config.timeout) => res?,
    };

    let status = match outcome {
        WaitOutcome::Exited(status) => status,
        WaitOutcome::TimedOut => {
            terminate_group(pid).await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(Error::Process(format!(
                "process timed out after {:?}",
                config.timeout.unwrap_or_default()
            )));
        }
    };

    let stdout_lines = stdout_task
        .await
        .map_err(|e| Error::Process(format!("stdout reader failed: {e}")))?;
    let stderr_lines = stderr_task
        .await
        .map_err(|e| Error::Process(format!("stderr reader failed: {e}")))?;

    let (exit_code, signal) = extract_exit_info(&status);

    Ok(ProcessOutput {
        exit_code,
        signal,
        stdout_lines,
        stderr_lines,
    })
}

async fn wait_with_timeout(
    child: &mut tokio::process::Child,
    timeout: Option<Duration>,
) -> Result<WaitOutcome> {
    match timeout {
        Some(dur) => match tokio::time::timeout(dur, child.wait()).await {
            Ok(res) => Ok(WaitOutcome::Exited(
                res.map_err(|e| Error::Process(format!("wait error: {e}")))?,
            )),
            Err(_) => Ok(WaitOutcome::TimedOut),
        },
        None => Ok(WaitOutcome::Exited(
            child
                .wait()
                .await
                .map_err(|e| Error::Process(format!("wait error: {e}")))?,
        )),
    }
}

/// SIGTERM the process group, give it a moment, then SIGKILL.
pub(crate) async fn terminate_group(pid: u32) {
    #[cfg(unix)]
    {
        unsafe {
            libc::killpg(pid as i32, libc::SIGTERM);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        // kill_on_drop covers non-Unix platforms.
        let _ = pid;
    }
}

pub(crate) fn extract_exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}
