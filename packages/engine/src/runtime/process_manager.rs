// packages/engine/src/runtime/process_manager.rs
//! Process manager for running sandboxed tool invocations
//!
//! A run is bounded two ways:
//! - **Hard timeout**: the process group is killed and the run reports
//!   [`ProcessOutcome::HardTimeout`]
//! - **Cancellation**: the job's soft-timeout token fires first; the process
//!   group is killed and the run reports [`ProcessOutcome::Cancelled`]
//!
//! stdout and stderr are read concurrently and merged, line by line, into a
//! single text stream in arrival order.

use crate::runtime::sandbox::SandboxedCommand;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum number of diagnostic lines surfaced to callers
pub const DIAGNOSTIC_LINE_LIMIT: usize = 50;

/// Exit indicator reported when the hard timeout kills a process
pub const HARD_TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit indicator reported when a process could not be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// How long to wait for a killed process to be reaped
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long to keep draining output pipes after the process is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Raw outcome of one process run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process exited on its own (signal deaths map to `128 + signo`)
    Exited { exit_code: i32, output: String },
    /// Killed after exceeding the hard timeout
    HardTimeout { output: String, limit: Duration },
    /// Killed because the job was cancelled
    Cancelled { output: String },
    /// The process could not be started or waited on
    Failed { message: String },
}

impl ProcessOutcome {
    pub fn output(&self) -> &str {
        match self {
            ProcessOutcome::Exited { output, .. }
            | ProcessOutcome::HardTimeout { output, .. }
            | ProcessOutcome::Cancelled { output } => output,
            ProcessOutcome::Failed { message } => message,
        }
    }

    pub fn exited_successfully(&self) -> bool {
        matches!(self, ProcessOutcome::Exited { exit_code: 0, .. })
    }
}

/// Keep at most the tail of a long diagnostic text.
///
/// When the text splits into more than [`DIAGNOSTIC_LINE_LIMIT`] pieces on
/// `\n`, the window `[len - 50, len - 1)` is kept: the last fifty pieces
/// minus the final one.
pub fn truncate_diagnostics(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() <= DIAGNOSTIC_LINE_LIMIT {
        return text.to_string();
    }

    lines[lines.len() - DIAGNOSTIC_LINE_LIMIT..lines.len() - 1].join("\n")
}

enum WaitResult {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(std::io::Error),
}

/// Runs sandboxed commands under time limits
pub struct ProcessManager {
    /// Paths to executables (cached)
    executable_paths: DashMap<String, PathBuf>,
}

impl ProcessManager {
    /// Create a new process manager
    pub fn new() -> Self {
        Self {
            executable_paths: DashMap::new(),
        }
    }

    /// Resolve a program name against PATH
    fn find_executable(&self, program: &str) -> Result<PathBuf> {
        if let Some(path) = self.executable_paths.get(program) {
            return Ok(path.value().clone());
        }

        match which::which(program) {
            Ok(path) => {
                info!("Found {} at {:?}", program, path);
                self.executable_paths.insert(program.to_string(), path.clone());
                Ok(path)
            }
            Err(e) => Err(EngineError::ProcessSpawnFailed(format!(
                "Executable '{}' not found in PATH: {}",
                program, e
            ))),
        }
    }

    /// Run a command to completion, hard timeout, or cancellation
    pub async fn run(
        &self,
        command: &SandboxedCommand,
        hard_timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProcessOutcome {
        if cancel.is_cancelled() {
            debug!("Run cancelled before start: {}", command.display());
            return ProcessOutcome::Cancelled {
                output: String::new(),
            };
        }

        let mut child = match self.spawn(command) {
            Ok(child) => child,
            Err(e) => {
                warn!("Could not start {}: {}", command.display(), e);
                return ProcessOutcome::Failed {
                    message: e.to_string(),
                };
            }
        };

        let pid = child.id();
        debug!("Running {} (pid {:?})", command.display(), pid);

        let capture = tokio::spawn(capture_combined(child.stdout.take(), child.stderr.take()));
        let started = Instant::now();

        let waited = tokio::select! {
            biased;

            _ = cancel.cancelled() => WaitResult::Cancelled,

            status = tokio::time::timeout(hard_timeout, child.wait()) => match status {
                Ok(Ok(status)) => WaitResult::Exited(status),
                Ok(Err(e)) => WaitResult::WaitFailed(e),
                Err(_) => WaitResult::TimedOut,
            },
        };

        let waited = settle(waited, &mut child);

        if !matches!(waited, WaitResult::Exited(_)) {
            terminate(&mut child, pid).await;
        }

        let output = drain(capture).await;
        let elapsed = started.elapsed();

        match waited {
            WaitResult::Exited(status) => {
                let exit_code = status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
                debug!("Process exited with code {} after {:?}", exit_code, elapsed);
                ProcessOutcome::Exited { exit_code, output }
            }
            WaitResult::TimedOut => {
                warn!(
                    "Process exceeded hard timeout of {:?}, killed: {}",
                    hard_timeout,
                    command.display()
                );
                ProcessOutcome::HardTimeout {
                    output,
                    limit: hard_timeout,
                }
            }
            WaitResult::Cancelled => {
                warn!("Process cancelled after {:?}: {}", elapsed, command.display());
                ProcessOutcome::Cancelled { output }
            }
            WaitResult::WaitFailed(e) => ProcessOutcome::Failed {
                message: format!("Failed to wait for process: {}", e),
            },
        }
    }

    fn spawn(&self, command: &SandboxedCommand) -> Result<Child> {
        let executable = self.find_executable(&command.program)?;

        let mut cmd = Command::new(executable);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            // own process group, so a kill also reaches the tool's children
            .process_group(0);

        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        cmd.spawn().map_err(|e| {
            EngineError::ProcessSpawnFailed(format!("Failed to spawn process: {}", e))
        })
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A process that already exited when the deadline or cancellation won the
/// race keeps its real exit status
fn settle(waited: WaitResult, child: &mut Child) -> WaitResult {
    if !matches!(waited, WaitResult::Cancelled | WaitResult::TimedOut) {
        return waited;
    }

    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("Process had already exited with {} when stopped", status);
            WaitResult::Exited(status)
        }
        _ => waited,
    }
}

/// Kill the whole process group, then reap the child
async fn terminate(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        debug!("Sending SIGKILL to process group {}", pid);
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", pid, e);
        }
    }

    if let Err(e) = child.start_kill() {
        debug!("start_kill failed: {}", e);
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!("Killed process exited with status: {}", status),
        Ok(Err(e)) => warn!("Error waiting for killed process: {}", e),
        Err(_) => warn!("Killed process was not reaped within {:?}", KILL_GRACE),
    }
}

async fn drain(mut capture: JoinHandle<String>) -> String {
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut capture).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("Output capture task failed: {}", e);
            String::new()
        }
        Err(_) => {
            // a detached grandchild is still holding the pipes open
            warn!("Output pipes still open after {:?}, discarding capture", DRAIN_TIMEOUT);
            capture.abort();
            String::new()
        }
    }
}

/// Merge stdout and stderr into one text, lines joined by `\n`
async fn capture_combined(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> String {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut lines = Vec::new();

    let readers = async move {
        tokio::join!(
            forward_lines(stdout.map(BufReader::new), tx.clone()),
            forward_lines(stderr.map(BufReader::new), tx),
        );
    };
    let collect = async {
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
    };
    tokio::join!(readers, collect);

    lines.join("\n")
}

/// Send each line of `reader`, lossily decoded, until EOF or a read error
async fn forward_lines<R: AsyncBufRead + Unpin>(reader: Option<R>, tx: mpsc::UnboundedSender<String>) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    break;
                }
            }
        }
    }
}
