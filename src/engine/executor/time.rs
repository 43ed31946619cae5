//! GNU time backend
//!
//! Runs `time -f "%U\n%M\n%x" -o <result> <command>` in its own process group.
//! The report has three lines (CPU seconds, peak KB, exit code), optionally
//! preceded by a line GNU time adds when the command was signalled or exited
//! with a non-zero status.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

use super::{
    group_command, hard_time_exceeded, memory_exceeded, monitor_failure, read_stderr_excerpt,
    supervise, ExecuteRequest, Executor, Supervision, Watch,
};
use crate::core::result::signal_name;
use crate::core::{CancelToken, ExecutionResult, JudgeError, Status};

pub const DEFAULT_TIME_PATH: &str = "/usr/bin/time";

const TIME_FORMAT: &str = "%U\\n%M\\n%x";
const SIGNALLED_PREFIX: &str = "Command terminated by signal ";
const NON_ZERO_PREFIX: &str = "Command exited with non-zero status ";

/// Executor measuring CPU time and peak RSS with GNU time
pub struct TimeExecutor {
    time_path: PathBuf,
}

impl TimeExecutor {
    pub fn new(time_path: impl Into<PathBuf>) -> Self {
        Self {
            time_path: time_path.into(),
        }
    }
}

#[async_trait]
impl Executor for TimeExecutor {
    fn name(&self) -> &str {
        "time"
    }

    async fn execute(&self, request: &ExecuteRequest, cancel: &CancelToken) -> Result<ExecutionResult> {
        let stderr_path = request.result_path.with_extension("stderr");
        let stderr = std::fs::File::create(&stderr_path)
            .with_context(|| format!("Failed to create {:?}", stderr_path))?;

        let mut cmd = group_command(&self.time_path, request, Stdio::from(stderr))?;
        cmd.arg("-f")
            .arg(TIME_FORMAT)
            .arg("-o")
            .arg(&request.result_path)
            .args(&request.command);

        debug!("Running {:?} under GNU time", request.command);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", self.time_path))?;

        let watch = Watch {
            hard_limit: Duration::from_millis(request.hard_time_limit_ms),
            memory_limit_kb: Some(request.memory_limit_kb),
            comm: request.executable_comm(),
        };

        match supervise(&mut child, &watch, cancel).await? {
            Supervision::Cancelled => return Err(JudgeError::Cancelled.into()),
            Supervision::MemoryExceeded { peak_kb } => return Ok(memory_exceeded(request, peak_kb)),
            Supervision::HardTimeLimit { .. } => return Ok(hard_time_exceeded(request)),
            Supervision::Exited(_) => {}
        }

        let report = tokio::fs::read_to_string(&request.result_path)
            .await
            .unwrap_or_default();
        let mut result = match parse_time_report(&report) {
            Ok(report) => report.into_result(),
            Err(err) => monitor_failure(err),
        };

        if result.status != Status::Accepted && result.stderr.is_none() {
            result.stderr = read_stderr_excerpt(&stderr_path).await;
        }
        Ok(result)
    }
}

/// Parsed GNU time report
#[derive(Debug, Clone, PartialEq)]
pub struct TimeReport {
    pub time_ms: i64,
    pub memory_kb: i64,
    pub exit_code: i32,
    /// Signal from a "Command terminated by signal N" line
    pub signal: Option<i32>,
}

impl TimeReport {
    pub fn into_result(self) -> ExecutionResult {
        let base = ExecutionResult::new(Status::Accepted)
            .with_time(self.time_ms)
            .with_memory(self.memory_kb);

        if let Some(signal) = self.signal {
            let mut result = base
                .with_signal(signal)
                .with_error(format!("Solution terminated by {}", signal_name(signal)));
            result.status = Status::RuntimeError;
            return result;
        }

        if self.exit_code != 0 {
            let mut result = base.with_error(format!("Solution exited with code {}", self.exit_code));
            result.status = Status::RuntimeError;
            // Shells report death by signal N as 128 + N
            if self.exit_code > 128 && self.exit_code < 128 + 65 {
                result.exit_signal = Some(self.exit_code - 128);
            }
            return result;
        }

        base
    }
}

/// Parse the report written by `time -f "%U\n%M\n%x"`
pub fn parse_time_report(report: &str) -> Result<TimeReport, JudgeError> {
    let failure = |message: &str| JudgeError::MonitorFailure {
        message: message.to_string(),
        raw: report.to_string(),
    };

    let mut lines: Vec<&str> = report.trim_end().lines().map(str::trim).collect();
    let mut signal = None;

    if let Some(first) = lines.first() {
        if let Some(rest) = first.strip_prefix(SIGNALLED_PREFIX) {
            signal = Some(
                rest.trim()
                    .parse::<i32>()
                    .map_err(|_| failure("Unreadable signal number from time command"))?,
            );
            lines.remove(0);
        } else if first.starts_with(NON_ZERO_PREFIX) {
            // The exit code is repeated on the last line
            lines.remove(0);
        }
    }

    if lines.len() != 3 {
        // A signalled run may end before time writes the record
        if let (Some(signal), true) = (signal, lines.is_empty()) {
            return Ok(TimeReport {
                time_ms: -1,
                memory_kb: -1,
                exit_code: 0,
                signal: Some(signal),
            });
        }
        return Err(failure("Unexpected output from time command"));
    }

    let seconds: f64 = lines[0]
        .parse()
        .map_err(|_| failure("Unreadable CPU time from time command"))?;
    let memory_kb: i64 = lines[1]
        .parse()
        .map_err(|_| failure("Unreadable memory from time command"))?;
    let exit_code: i32 = lines[2]
        .parse()
        .map_err(|_| failure("Unreadable exit code from time command"))?;

    Ok(TimeReport {
        time_ms: (seconds * 1000.0).round() as i64,
        memory_kb,
        exit_code,
        signal,
    })
}
