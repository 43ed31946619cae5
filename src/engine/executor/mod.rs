//! Executor module - runs one program under a resource monitor
//!
//! Two backends share this interface:
//! - `TimeExecutor`: GNU `time` wrapper with a supervising poll loop
//! - `SandboxExecutor`: sio2jail with instruction-count based time
//!
//! The executor module does NOT:
//! - Compare outputs or run checkers
//! - Apply the soft time/memory limits to a finished run (see `engine::runner`)
//! - Know about caching or scoring

pub mod sandbox;
pub mod time;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, error, warn};

use crate::core::{CancelToken, ExecutionResult, JudgeError, Status};

pub use sandbox::SandboxExecutor;
pub use time::TimeExecutor;

/// How often the supervising loop checks wall time and memory
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Largest stderr excerpt kept in a result
const MAX_STDERR_BYTES: usize = 4096;

/// Everything an executor needs to run one solution on one test
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// Program and arguments
    pub command: Vec<String>,
    /// Compiled artifact, used to tell the program apart from wrapper processes
    pub executable: PathBuf,
    /// Soft CPU time limit in milliseconds
    pub time_limit_ms: u64,
    /// Memory limit in KB
    pub memory_limit_kb: u64,
    /// Wall clock ceiling enforced by the core itself
    pub hard_time_limit_ms: u64,
    /// File the time tool writes its report to
    pub result_path: PathBuf,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
}

impl ExecuteRequest {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        let executable = executable.into();
        Self {
            command: vec![executable.to_string_lossy().to_string()],
            executable,
            time_limit_ms: 1000,
            memory_limit_kb: 256 * 1024,
            hard_time_limit_ms: 2000,
            result_path: PathBuf::new(),
            stdin: PathBuf::from("/dev/null"),
            stdout: PathBuf::from("/dev/null"),
        }
    }

    pub fn with_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set soft limits. The hard limit follows as twice the time limit.
    pub fn with_limits(mut self, time_limit_ms: u64, memory_limit_kb: u64) -> Self {
        self.time_limit_ms = time_limit_ms;
        self.memory_limit_kb = memory_limit_kb;
        self.hard_time_limit_ms = 2 * time_limit_ms;
        self
    }

    pub fn with_hard_time_limit(mut self, hard_time_limit_ms: u64) -> Self {
        self.hard_time_limit_ms = hard_time_limit_ms;
        self
    }

    pub fn with_io(mut self, stdin: impl Into<PathBuf>, stdout: impl Into<PathBuf>) -> Self {
        self.stdin = stdin.into();
        self.stdout = stdout.into();
        self
    }

    pub fn with_result_path(mut self, result_path: impl Into<PathBuf>) -> Self {
        self.result_path = result_path.into();
        self
    }

    /// File name of the executable as the kernel reports it in `/proc/<pid>/comm`
    fn executable_comm(&self) -> String {
        let name = self
            .executable
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        name.chars().take(15).collect()
    }
}

/// Executor trait for running programs under a resource monitor
#[async_trait]
pub trait Executor: Send + Sync {
    /// Backend name, part of every cache key
    fn name(&self) -> &str;

    /// Run the request. Fails only on infrastructure errors or `JudgeError::Cancelled`.
    async fn execute(&self, request: &ExecuteRequest, cancel: &CancelToken) -> Result<ExecutionResult>;
}

/// Available measurement backends, selected once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// GNU time plus polling of the process group
    Time,
    /// sio2jail with instruction counting
    Sio2jail,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Time => "time",
            Backend::Sio2jail => "sio2jail",
        }
    }

    /// Build the executor for this backend. `tool_path` overrides the default binary.
    pub fn executor(self, tool_path: Option<PathBuf>) -> Arc<dyn Executor> {
        match self {
            Backend::Time => Arc::new(TimeExecutor::new(
                tool_path.unwrap_or_else(|| PathBuf::from(time::DEFAULT_TIME_PATH)),
            )),
            Backend::Sio2jail => Arc::new(SandboxExecutor::new(
                tool_path.unwrap_or_else(|| PathBuf::from(sandbox::DEFAULT_SIO2JAIL_PATH)),
            )),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How a supervised child ended
#[derive(Debug)]
pub(crate) enum Supervision {
    Exited(ExitStatus),
    /// Killed because a process in the group went over the memory limit
    MemoryExceeded { peak_kb: u64 },
    /// Killed by the hard wall clock ceiling
    HardTimeLimit { elapsed: Duration },
    Cancelled,
}

/// Limits the supervising loop enforces on a running process group
#[derive(Debug, Clone)]
pub(crate) struct Watch {
    pub hard_limit: Duration,
    /// Memory ceiling in KB. `None` when the backend enforces memory itself.
    pub memory_limit_kb: Option<u64>,
    /// Only processes with this `comm` are measured
    pub comm: String,
}

/// Prepare a command that runs in its own process group with files for stdin/stdout
pub(crate) fn group_command(
    program: &Path,
    request: &ExecuteRequest,
    stderr: Stdio,
) -> Result<Command> {
    let stdin = std::fs::File::open(&request.stdin)
        .with_context(|| format!("Failed to open stdin {:?}", request.stdin))?;
    let stdout = std::fs::File::create(&request.stdout)
        .with_context(|| format!("Failed to create stdout {:?}", request.stdout))?;

    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(stderr)
        .process_group(0)
        .kill_on_drop(true);
    Ok(cmd)
}

/// Wait for a child, killing its whole process group on memory, hard time or cancellation.
pub(crate) async fn supervise(
    child: &mut Child,
    watch: &Watch,
    cancel: &CancelToken,
) -> Result<Supervision> {
    let pgid = child
        .id()
        .map(|pid| pid as i32)
        .context("Child exited before supervision started")?;
    let start = Instant::now();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut peak_kb = 0u64;

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for child process")?;
                return Ok(Supervision::Exited(status));
            }
            _ = cancel.cancelled() => {
                debug!("Cancelling process group {}", pgid);
                kill_group(pgid);
                let _ = child.wait().await;
                return Ok(Supervision::Cancelled);
            }
            _ = ticker.tick() => {
                let elapsed = start.elapsed();
                if elapsed > watch.hard_limit {
                    warn!("Process group {} hit the hard time limit after {:?}", pgid, elapsed);
                    kill_group(pgid);
                    let _ = child.wait().await;
                    return Ok(Supervision::HardTimeLimit { elapsed });
                }
                if let Some(limit) = watch.memory_limit_kb {
                    if let Some(rss) = group_rss_kb(pgid, &watch.comm) {
                        peak_kb = peak_kb.max(rss);
                        if rss > limit {
                            debug!("Process group {} uses {} KB, limit {} KB", pgid, rss, limit);
                            kill_group(pgid);
                            let _ = child.wait().await;
                            return Ok(Supervision::MemoryExceeded { peak_kb });
                        }
                    }
                }
            }
        }
    }
}

/// Send SIGKILL to a process group, ignoring groups that are already gone
pub(crate) fn kill_group(pgid: i32) {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => error!("Failed to kill process group {}: {}", pgid, e),
    }
}

/// Largest resident set (KB) among processes of the group whose `comm` matches
fn group_rss_kb(pgid: i32, comm: &str) -> Option<u64> {
    let entries = std::fs::read_dir("/proc").ok()?;
    let mut largest = None;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        let Some((proc_comm, pgrp)) = parse_stat(&stat) else {
            continue;
        };
        if pgrp != pgid || proc_comm != comm {
            continue;
        }
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            if let Some(rss) = parse_vm_rss(&status) {
                largest = Some(largest.map_or(rss, |l: u64| l.max(rss)));
            }
        }
    }

    largest
}

/// Extract `(comm, pgrp)` from `/proc/<pid>/stat`
fn parse_stat(stat: &str) -> Option<(&str, i32)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = &stat[open + 1..close];
    // Fields after the comm: state ppid pgrp ...
    let mut rest = stat[close + 1..].split_whitespace();
    let pgrp = rest.nth(2)?.parse().ok()?;
    Some((comm, pgrp))
}

/// Extract `VmRSS` in KB from `/proc/<pid>/status`
fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

/// Result for a run killed by the core's own memory watch
pub(crate) fn memory_exceeded(request: &ExecuteRequest, peak_kb: u64) -> ExecutionResult {
    ExecutionResult::new(Status::MemoryLimitExceeded)
        .with_memory(peak_kb.max(request.memory_limit_kb + 1) as i64)
}

/// Result for a run killed by the hard wall clock ceiling
pub(crate) fn hard_time_exceeded(request: &ExecuteRequest) -> ExecutionResult {
    ExecutionResult::new(Status::TimeLimitExceeded)
        .with_time(request.time_limit_ms as i64 + 1)
        .with_error("Killed after exceeding the hard time limit")
}

/// Turn a monitor failure into a runtime error that keeps the raw output
pub(crate) fn monitor_failure(err: JudgeError) -> ExecutionResult {
    match err {
        JudgeError::MonitorFailure { message, raw } => {
            error!("{}. Raw time tool output:\n{}", message, raw);
            ExecutionResult::runtime_error(message).with_stderr(raw)
        }
        other => ExecutionResult::runtime_error(other.to_string()),
    }
}

/// Read at most `MAX_STDERR_BYTES` of a captured stderr file
pub(crate) async fn read_stderr_excerpt(path: &Path) -> Option<String> {
    let data = tokio::fs::read(path).await.ok()?;
    if data.is_empty() {
        return None;
    }
    let end = data.len().min(MAX_STDERR_BYTES);
    Some(String::from_utf8_lossy(&data[..end]).to_string())
}
