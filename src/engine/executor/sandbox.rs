//! sio2jail backend
//!
//! sio2jail enforces limits itself and writes an `oiaug` report to stderr:
//!
//! ```text
//! <oiaug-code> <raw-code> <time-ms> <unused> <memory-kb> <syscalls>
//! <message>
//! ```
//!
//! Only the message decides the status; the numeric codes are kept for logging.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    group_command, hard_time_exceeded, monitor_failure, supervise, ExecuteRequest, Executor,
    Supervision, Watch,
};
use crate::core::result::signal_name;
use crate::core::{CancelToken, ExecutionResult, JudgeError, Status};

pub const DEFAULT_SIO2JAIL_PATH: &str = "sio2jail";

/// Extra wall time granted on top of sio2jail's own real time limit
const HARD_LIMIT_GRACE_MS: u64 = 1000;

/// Executor running programs inside sio2jail
pub struct SandboxExecutor {
    sio2jail_path: PathBuf,
}

impl SandboxExecutor {
    pub fn new(sio2jail_path: impl Into<PathBuf>) -> Self {
        Self {
            sio2jail_path: sio2jail_path.into(),
        }
    }
}

/// Real time limit handed to sio2jail
fn real_time_limit_ms(time_limit_ms: u64) -> u64 {
    16 * time_limit_ms + 1000
}

/// Arguments placed before `--` and the program command
pub fn sandbox_args(time_limit_ms: u64, memory_limit_kb: u64) -> Vec<String> {
    let mut args: Vec<String> = [
        "--mount-namespace",
        "off",
        "--pid-namespace",
        "off",
        "--uts-namespace",
        "off",
        "--ipc-namespace",
        "off",
        "--net-namespace",
        "off",
        "--capability-drop",
        "off",
        "--user-namespace",
        "off",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.extend([
        "--instruction-count-limit".to_string(),
        format!("{}M", 2 * time_limit_ms),
        "--rtimelimit".to_string(),
        format!("{}ms", real_time_limit_ms(time_limit_ms)),
        "--memory-limit".to_string(),
        format!("{}K", memory_limit_kb),
        "--output-limit".to_string(),
        "51200K".to_string(),
        "--output".to_string(),
        "oiaug".to_string(),
        "--stderr".to_string(),
        "--".to_string(),
    ]);
    args
}

#[async_trait]
impl Executor for SandboxExecutor {
    fn name(&self) -> &str {
        "sio2jail"
    }

    async fn execute(&self, request: &ExecuteRequest, cancel: &CancelToken) -> Result<ExecutionResult> {
        let report_file = std::fs::File::create(&request.result_path)
            .with_context(|| format!("Failed to create {:?}", request.result_path))?;

        let mut cmd = group_command(&self.sio2jail_path, request, Stdio::from(report_file))?;
        cmd.args(sandbox_args(request.time_limit_ms, request.memory_limit_kb))
            .args(&request.command)
            .env("UNDER_SIO2JAIL", "1");

        debug!("Running {:?} under sio2jail", request.command);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", self.sio2jail_path))?;

        let hard_limit_ms = request
            .hard_time_limit_ms
            .max(real_time_limit_ms(request.time_limit_ms))
            + HARD_LIMIT_GRACE_MS;
        let watch = Watch {
            hard_limit: Duration::from_millis(hard_limit_ms),
            memory_limit_kb: None,
            comm: request.executable_comm(),
        };

        match supervise(&mut child, &watch, cancel).await? {
            Supervision::Cancelled => return Err(JudgeError::Cancelled.into()),
            Supervision::HardTimeLimit { .. } => return Ok(hard_time_exceeded(request)),
            Supervision::MemoryExceeded { .. } | Supervision::Exited(_) => {}
        }

        let report = tokio::fs::read_to_string(&request.result_path)
            .await
            .unwrap_or_default();
        Ok(match parse_sandbox_report(&report) {
            Ok(report) => report.into_result(),
            Err(err) => monitor_failure(err),
        })
    }
}

/// Parsed sio2jail `oiaug` report
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxReport {
    /// oiaug status code (OK, RE, TLE, MLE, RV, OLE)
    pub code: String,
    pub raw_code: i32,
    pub time_ms: i64,
    pub memory_kb: i64,
    pub syscalls: i64,
    pub message: String,
    /// Program stderr printed before the report
    pub stderr: Option<String>,
}

impl SandboxReport {
    pub fn into_result(self) -> ExecutionResult {
        let mut result = ExecutionResult::new(Status::Accepted)
            .with_time(self.time_ms)
            .with_memory(self.memory_kb);
        result.stderr = self.stderr;

        let message = self.message.as_str();
        match message {
            "ok" if self.raw_code == 0 => {}
            "ok" => {
                result.status = Status::RuntimeError;
                result.error = Some(format!("Solution exited with code {}", self.raw_code));
            }
            "time limit exceeded" => result.status = Status::TimeLimitExceeded,
            "real time limit exceeded" => {
                result.status = Status::TimeLimitExceeded;
                result.error = Some(message.to_string());
            }
            "memory limit exceeded" => {
                result.status = Status::MemoryLimitExceeded;
                result.error = Some(message.to_string());
            }
            _ if message.starts_with("intercepted forbidden syscall") => {
                result.status = Status::RuleViolation;
                result.error = Some(message.to_string());
            }
            _ if message.starts_with("process exited due to signal") => {
                result.status = Status::RuntimeError;
                match message
                    .trim_start_matches("process exited due to signal")
                    .trim()
                    .parse::<i32>()
                {
                    Ok(signal) => {
                        result.exit_signal = Some(signal);
                        result.error = Some(format!("{} ({})", message, signal_name(signal)));
                    }
                    Err(_) => result.error = Some(message.to_string()),
                }
            }
            _ => {
                warn!(
                    "Unrecognized sio2jail result: {} (code {} {})",
                    message, self.code, self.raw_code
                );
                result.status = Status::RuntimeError;
                result.error = Some(format!("Unrecognized sandbox result: {}", message));
            }
        }
        result
    }
}

/// Parse the last two lines of a sio2jail report
pub fn parse_sandbox_report(report: &str) -> Result<SandboxReport, JudgeError> {
    let failure = |message: &str| JudgeError::MonitorFailure {
        message: message.to_string(),
        raw: report.to_string(),
    };

    let lines: Vec<&str> = report.trim_end().lines().collect();
    if lines.len() < 2 {
        return Err(failure("Could not parse sio2jail output"));
    }
    let status_line = lines[lines.len() - 2];
    let message = lines[lines.len() - 1].trim().to_string();

    let fields: Vec<&str> = status_line.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(failure("Could not parse sio2jail status line"));
    }
    let number = |field: &str| -> Result<i64, JudgeError> {
        field
            .parse::<i64>()
            .map_err(|_| failure("Could not parse sio2jail status line"))
    };

    let prefix = &lines[..lines.len() - 2];
    let stderr = (!prefix.is_empty()).then(|| prefix.join("\n"));

    Ok(SandboxReport {
        code: fields[0].to_string(),
        raw_code: number(fields[1])? as i32,
        time_ms: number(fields[2])?,
        memory_kb: number(fields[4])?,
        syscalls: number(fields[5])?,
        message,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Instant;

    /// Fake sio2jail: skips its own options, then runs `body` in place of the jail
    fn fake_sio2jail(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("sio2jail");
        let script = format!(
            "#!/bin/sh\nwhile [ \"$1\" != \"--\" ]; do shift; done\nshift\n{}",
            body
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request_in(dir: &Path) -> ExecuteRequest {
        std::fs::write(dir.join("abc1a.in"), "1 2\n").unwrap();
        ExecuteRequest::new("/bin/cat")
            .with_io(dir.join("abc1a.in"), dir.join("abc1a.out"))
            .with_result_path(dir.join("abc1a.res"))
    }

    fn result_for(report: &str) -> ExecutionResult {
        parse_sandbox_report(report).unwrap().into_result()
    }

    #[test]
    fn test_sandbox_args() {
        let args = sandbox_args(1000, 65536);
        let joined = args.join(" ");
        assert!(joined.contains("--instruction-count-limit 2000M"));
        assert!(joined.contains("--rtimelimit 17000ms"));
        assert!(joined.contains("--memory-limit 65536K"));
        assert!(joined.contains("--output-limit 51200K --output oiaug --stderr"));
        assert_eq!(args.last().map(String::as_str), Some("--"));
    }

    #[test]
    fn test_parse_ok() {
        let report = parse_sandbox_report("OK 0 123 0 4567 42\nok\n").unwrap();
        assert_eq!(report.code, "OK");
        assert_eq!(report.time_ms, 123);
        assert_eq!(report.memory_kb, 4567);
        assert_eq!(report.syscalls, 42);
        let result = report.into_result();
        assert_eq!(result.status, Status::Accepted);
        assert_eq!(result.time_ms, 123);
    }

    #[test]
    fn test_parse_limits() {
        assert_eq!(
            result_for("TLE 0 2001 0 1000 10\ntime limit exceeded\n").status,
            Status::TimeLimitExceeded
        );
        let real = result_for("TLE 0 500 0 1000 10\nreal time limit exceeded\n");
        assert_eq!(real.status, Status::TimeLimitExceeded);
        assert_eq!(real.error.as_deref(), Some("real time limit exceeded"));
        assert_eq!(
            result_for("MLE 0 10 0 70000 10\nmemory limit exceeded\n").status,
            Status::MemoryLimitExceeded
        );
    }

    #[test]
    fn test_parse_violations_and_signals() {
        let rv = result_for("RV 0 10 0 100 3\nintercepted forbidden syscall fork(57)\n");
        assert_eq!(rv.status, Status::RuleViolation);

        let sig = result_for("RE 139 10 0 100 3\nprocess exited due to signal 11\n");
        assert_eq!(sig.status, Status::RuntimeError);
        assert_eq!(sig.exit_signal, Some(11));
        assert!(sig.error.unwrap().contains("SIGSEGV"));
    }

    #[test]
    fn test_parse_unrecognized_message_keeps_it() {
        let result = result_for("RE 1 10 0 100 3\nruntime error 1\n");
        assert_eq!(result.status, Status::RuntimeError);
        assert_eq!(
            result.error.as_deref(),
            Some("Unrecognized sandbox result: runtime error 1")
        );
    }

    #[test]
    fn test_program_stderr_before_report() {
        let report = parse_sandbox_report("assertion failed\nOK 0 1 0 2 3\nok\n").unwrap();
        assert_eq!(report.stderr.as_deref(), Some("assertion failed"));
    }

    #[test]
    fn test_garbage_is_monitor_failure() {
        assert!(matches!(
            parse_sandbox_report("sio2jail: perf_event_open failed\n"),
            Err(JudgeError::MonitorFailure { .. })
        ));
        assert!(parse_sandbox_report("OK 0 x 0 2 3\nok\n").is_err());
    }

    #[tokio::test]
    async fn test_execute_reads_oiaug_report() {
        let dir = tempfile::tempdir().unwrap();
        let jail = fake_sio2jail(
            dir.path(),
            "\"$@\"\necho \"OK $? 12 0 345 7\" >&2\necho ok >&2\n",
        );
        let request = request_in(dir.path()).with_limits(1000, 65536);

        let result = SandboxExecutor::new(jail)
            .execute(&request, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(result.status, Status::Accepted);
        assert_eq!(result.time_ms, 12);
        assert_eq!(result.memory_kb, 345);
        assert_eq!(std::fs::read_to_string(&request.stdout).unwrap(), "1 2\n");
    }

    #[tokio::test]
    async fn test_execute_memory_verdict_from_report() {
        let dir = tempfile::tempdir().unwrap();
        let jail = fake_sio2jail(
            dir.path(),
            "echo 'MLE 0 40 0 70000 9' >&2\necho 'memory limit exceeded' >&2\n",
        );
        let request = request_in(dir.path()).with_limits(1000, 65536);

        let result = SandboxExecutor::new(jail)
            .execute(&request, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(result.status, Status::MemoryLimitExceeded);
        assert_eq!(result.memory_kb, 70000);
    }

    #[tokio::test]
    async fn test_hard_limit_waits_for_jail_grace() {
        let dir = tempfile::tempdir().unwrap();
        let jail = fake_sio2jail(dir.path(), "sleep 10\n");
        // 1ms gives a real time limit of 1016ms, plus the grace period
        let request = request_in(dir.path()).with_limits(1, 65536);

        let start = Instant::now();
        let result = SandboxExecutor::new(jail)
            .execute(&request, &CancelToken::never())
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert_eq!(result.status, Status::TimeLimitExceeded);
        assert!(elapsed >= Duration::from_millis(2000));
        assert!(elapsed < Duration::from_secs(8));
    }
}
