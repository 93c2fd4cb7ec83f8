use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::process::{extract_exit_info, terminate_group};

/// Per-stream capture budget.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;
/// Lines kept at each end when a huge capture is elided line-wise.
const ELIDE_KEEP_LINES: usize = 512;

/// Outcome of one shell command. Exit code -1 means the command never
/// produced a real status (spawn failure or timeout).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub passed: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    Passed,
    Failed,
}

/// Result of running the configured command sequence.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub status: VerificationStatus,
    pub results: Vec<CommandResult>,
    /// Commands attempted; blank entries are excluded.
    pub total: usize,
    pub passed_count: usize,
    pub duration: Duration,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.status == VerificationStatus::Passed
    }
}

/// Executes an ordered list of shell commands with a per-command timeout.
///
/// Command strings are opaque and handed to the platform shell. Failures of
/// individual commands are data; the only runner-level error is the parent
/// token being cancelled while a command is running.
#[derive(Debug, Clone)]
pub struct VerificationRunner {
    commands: Vec<String>,
    work_dir: PathBuf,
    command_timeout: Duration,
}

impl VerificationRunner {
    pub fn new(commands: Vec<String>, work_dir: PathBuf, command_timeout: Duration) -> Self {
        Self {
            commands,
            work_dir,
            command_timeout,
        }
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub async fn run(
        &self,
        cancel: &CancellationToken,
        stop_on_failure: bool,
    ) -> Result<VerificationReport> {
        let started = Instant::now();
        let mut results: Vec<CommandResult> = Vec::new();

        for raw in &self.commands {
            let command = raw.trim();
            if command.is_empty() {
                warn!("skipping blank verification command");
                continue;
            }
            if cancel.is_cancelled() {
                info!("cancelled between verification commands, returning partial results");
                break;
            }

            let result = self.run_command(cancel, command).await?;
            let failed = !result.passed;
            results.push(result);
            if stop_on_failure && failed {
                break;
            }
        }

        let passed_count = results.iter().filter(|r| r.passed).count();
        let status = if results.iter().all(|r| r.passed) {
            VerificationStatus::Passed
        } else {
            VerificationStatus::Failed
        };

        Ok(VerificationReport {
            status,
            total: results.len(),
            passed_count,
            results,
            duration: started.elapsed(),
        })
    }

    async fn run_command(
        &self,
        cancel: &CancellationToken,
        command: &str,
    ) -> Result<CommandResult> {
        let started = Instant::now();
        info!(command, "running verification command");

        let mut cmd = shell_command(command);
        cmd.current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command, error = %e, "failed to spawn verification command");
                return Ok(CommandResult {
                    command: command.to_string(),
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("spawn failed: {e}"),
                    duration: started.elapsed(),
                    passed: false,
                    timed_out: false,
                });
            }
        };
        let pid = child.id();

        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(pid) = pid {
                    terminate_group(pid).await;
                }
                Err(Error::Verification(format!(
                    "cancelled while running '{command}'"
                )))
            }
            waited = tokio::time::timeout(self.command_timeout, child.wait_with_output()) => {
                match waited {
                    Ok(Ok(output)) => {
                        let (exit_code, _signal) = extract_exit_info(&output.status);
                        let stdout =
                            truncate_output(&String::from_utf8_lossy(&output.stdout), MAX_CAPTURE_BYTES);
                        let stderr =
                            truncate_output(&String::from_utf8_lossy(&output.stderr), MAX_CAPTURE_BYTES);
                        let passed = exit_code == 0;
                        if !passed {
                            warn!(command, exit_code, "verification command failed");
                        }
                        Ok(CommandResult {
                            command: command.to_string(),
                            exit_code,
                            stdout,
                            stderr,
                            duration: started.elapsed(),
                            passed,
                            timed_out: false,
                        })
                    }
                    Ok(Err(e)) => Ok(CommandResult {
                        command: command.to_string(),
                        exit_code: -1,
                        stdout: String::new(),
                        stderr: format!("wait failed: {e}"),
                        duration: started.elapsed(),
                        passed: false,
                        timed_out: false,
                    }),
                    Err(_) => {
                        warn!(command, timeout = ?self.command_timeout, "verification command timed out");
                        #[cfg(unix)]
                        if let Some(pid) = pid {
                            unsafe {
                                libc::killpg(pid as i32, libc::SIGKILL);
                            }
                        }
                        Ok(CommandResult {
                            command: command.to_string(),
                            exit_code: -1,
                            stdout: String::new(),
                            stderr: String::new(),
                            duration: started.elapsed(),
                            passed: false,
                            timed_out: true,
                        })
                    }
                }
            }
        }
    }
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Cap captured output at `max_bytes`.
///
/// Very long captures keep the first and last 512 lines with an elision
/// marker; otherwise the text is cut at a char boundary with a truncation
/// suffix, always ending up strictly shorter than the input.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let lines: Vec<&str> = text.lines().collect();
    if lines.len() > 2 * ELIDE_KEEP_LINES {
        let omitted = lines.len() - 2 * ELIDE_KEEP_LINES;
        let head = lines[..ELIDE_KEEP_LINES].join("\n");
        let tail = lines[lines.len() - ELIDE_KEEP_LINES..].join("\n");
        return format!("{head}\n... {omitted} lines omitted ...\n{tail}");
    }

    let mut end = max_bytes.saturating_sub(64);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n(output truncated)", &text[..end])
}
