//! Runner module - one solution on one test
//!
//! Builds the executor request, applies the soft limits to what the backend
//! measured and judges the produced output.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::checker::{judge_output, Checker};
use super::executor::{ExecuteRequest, Executor};
use crate::core::error::is_cancellation;
use crate::core::{CancelToken, ExecutionResult, Status};

/// A single job with everything resolved
#[derive(Debug, Clone)]
pub struct TestRun {
    /// Solution file name, used for the per-solution output directory
    pub solution: String,
    pub executable: PathBuf,
    /// Test name, e.g. `abc1a`
    pub test: String,
    pub input: PathBuf,
    pub answer: PathBuf,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
}

impl TestRun {
    /// Request writing `<executions>/<solution>/<test>.out` and `.res`
    pub fn request(&self, executions_dir: &Path) -> ExecuteRequest {
        let dir = executions_dir.join(&self.solution);
        ExecuteRequest::new(&self.executable)
            .with_limits(self.time_limit_ms, self.memory_limit_kb)
            .with_io(&self.input, dir.join(format!("{}.out", self.test)))
            .with_result_path(dir.join(format!("{}.res", self.test)))
    }
}

/// Run one job to completion.
///
/// Infrastructure failures of the executor become RE for this job only.
/// The only error returned is cancellation.
pub async fn run_test(
    executor: &dyn Executor,
    checker: Option<&Checker>,
    run: &TestRun,
    executions_dir: &Path,
    cancel: &CancelToken,
) -> Result<ExecutionResult> {
    let request = run.request(executions_dir);
    if let Some(dir) = request.stdout.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {:?}", dir))?;
    }

    debug!("Running {} on {}", run.solution, run.test);
    let result = match executor.execute(&request, cancel).await {
        Ok(result) => result,
        Err(e) if is_cancellation(&e) => return Err(e),
        Err(e) => {
            warn!("Executor failed for {} on {}: {:#}", run.solution, run.test, e);
            ExecutionResult::runtime_error(format!("{:#}", e))
        }
    };

    let result = apply_limits(result, run.time_limit_ms, run.memory_limit_kb);
    if result.status != Status::Accepted {
        return Ok(result);
    }

    match judge_output(checker, &run.input, &request.stdout, &run.answer).await {
        Ok(verdict) if verdict.accepted => Ok(result.with_points(verdict.points)),
        Ok(verdict) => {
            let mut result = ExecutionResult {
                status: Status::WrongAnswer,
                points: 0.0,
                ..result
            };
            result.error = verdict.message;
            Ok(result)
        }
        Err(e) => {
            warn!("Judging {} on {} failed: {:#}", run.solution, run.test, e);
            Ok(ExecutionResult {
                status: Status::RuntimeError,
                points: 0.0,
                error: Some(format!("{:#}", e)),
                ..result
            })
        }
    }
}

/// Classify a measured run against the soft limits.
///
/// Time over the limit wins over memory, and both win over a plain runtime
/// error, since a process killed by a limit usually also exits abnormally.
pub fn apply_limits(result: ExecutionResult, time_limit_ms: u64, memory_limit_kb: u64) -> ExecutionResult {
    if !matches!(result.status, Status::Accepted | Status::RuntimeError) {
        return result;
    }
    let status = if result.time().is_some_and(|t| t > time_limit_ms as i64) {
        Status::TimeLimitExceeded
    } else if result.memory().is_some_and(|m| m > memory_limit_kb as i64) {
        Status::MemoryLimitExceeded
    } else {
        return result;
    };
    ExecutionResult {
        status,
        points: 0.0,
        ..result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JudgeError;
    use async_trait::async_trait;

    /// Writes a fixed output and reports fixed measurements
    struct FixedExecutor {
        output: &'static str,
        result: ExecutionResult,
    }

    #[async_trait]
    impl Executor for FixedExecutor {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn execute(&self, request: &ExecuteRequest, _cancel: &CancelToken) -> Result<ExecutionResult> {
            std::fs::write(&request.stdout, self.output)?;
            Ok(self.result.clone())
        }
    }

    struct BrokenExecutor {
        cancelled: bool,
    }

    #[async_trait]
    impl Executor for BrokenExecutor {
        fn name(&self) -> &str {
            "broken"
        }

        async fn execute(&self, _request: &ExecuteRequest, _cancel: &CancelToken) -> Result<ExecutionResult> {
            if self.cancelled {
                Err(JudgeError::Cancelled.into())
            } else {
                anyhow::bail!("sio2jail: No such file or directory")
            }
        }
    }

    fn fixture(dir: &Path) -> TestRun {
        std::fs::write(dir.join("abc1a.in"), "1 2\n").unwrap();
        std::fs::write(dir.join("abc1a.out"), "3\n").unwrap();
        TestRun {
            solution: "abc.cpp".into(),
            executable: dir.join("abc.e"),
            test: "abc1a".into(),
            input: dir.join("abc1a.in"),
            answer: dir.join("abc1a.out"),
            time_limit_ms: 1000,
            memory_limit_kb: 65536,
        }
    }

    fn measured(status: Status, time_ms: i64, memory_kb: i64) -> ExecutionResult {
        ExecutionResult::new(status).with_time(time_ms).with_memory(memory_kb)
    }

    #[test]
    fn test_apply_limits() {
        let tl = apply_limits(measured(Status::Accepted, 1001, 10), 1000, 100);
        assert_eq!(tl.status, Status::TimeLimitExceeded);
        assert_eq!(tl.time_ms, 1001);

        let ml = apply_limits(measured(Status::RuntimeError, 10, 101), 1000, 100);
        assert_eq!(ml.status, Status::MemoryLimitExceeded);

        let ok = apply_limits(measured(Status::Accepted, 1000, 100), 1000, 100);
        assert_eq!(ok.status, Status::Accepted);

        let unmeasured = apply_limits(ExecutionResult::runtime_error("boom"), 1000, 100);
        assert_eq!(unmeasured.status, Status::RuntimeError);
    }

    #[test]
    fn test_request_paths() {
        let dir = tempfile::tempdir().unwrap();
        let run = fixture(dir.path());
        let request = run.request(Path::new("/cache/executions"));
        assert_eq!(request.stdout, PathBuf::from("/cache/executions/abc.cpp/abc1a.out"));
        assert_eq!(request.result_path, PathBuf::from("/cache/executions/abc.cpp/abc1a.res"));
        assert_eq!(request.hard_time_limit_ms, 2000);
    }

    #[tokio::test]
    async fn test_accepted_and_wrong_answer() {
        let dir = tempfile::tempdir().unwrap();
        let run = fixture(dir.path());
        let executions = dir.path().join("executions");

        let good = FixedExecutor {
            output: "3\n",
            result: measured(Status::Accepted, 10, 100),
        };
        let result = run_test(&good, None, &run, &executions, &CancelToken::never()).await.unwrap();
        assert_eq!(result.status, Status::Accepted);
        assert_eq!(result.points, 100.0);

        let bad = FixedExecutor {
            output: "4\n",
            result: measured(Status::Accepted, 10, 100),
        };
        let result = run_test(&bad, None, &run, &executions, &CancelToken::never()).await.unwrap();
        assert_eq!(result.status, Status::WrongAnswer);
        assert_eq!(result.points, 0.0);
    }

    #[tokio::test]
    async fn test_slow_run_is_not_judged() {
        let dir = tempfile::tempdir().unwrap();
        let run = fixture(dir.path());
        let slow = FixedExecutor {
            output: "3\n",
            result: measured(Status::Accepted, 1500, 100),
        };
        let result = run_test(&slow, None, &run, &dir.path().join("x"), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(result.status, Status::TimeLimitExceeded);
        assert_eq!(result.points, 0.0);
    }

    #[tokio::test]
    async fn test_executor_failure_is_runtime_error() {
        let dir = tempfile::tempdir().unwrap();
        let run = fixture(dir.path());
        let result = run_test(
            &BrokenExecutor { cancelled: false },
            None,
            &run,
            &dir.path().join("x"),
            &CancelToken::never(),
        )
        .await
        .unwrap();
        assert_eq!(result.status, Status::RuntimeError);
        assert!(result.error.unwrap().contains("No such file"));

        let cancelled = run_test(
            &BrokenExecutor { cancelled: true },
            None,
            &run,
            &dir.path().join("x"),
            &CancelToken::never(),
        )
        .await;
        let err = tokio_test::assert_err!(cancelled);
        assert!(is_cancellation(&err));
    }

    #[tokio::test]
    async fn test_checker_failure_is_runtime_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let run = fixture(dir.path());
        let checker_path = dir.path().join("abcchk.e");
        std::fs::write(&checker_path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&checker_path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let good = FixedExecutor {
            output: "3\n",
            result: measured(Status::Accepted, 10, 100),
        };
        let checker = Checker::new(&checker_path);
        let result = run_test(&good, Some(&checker), &run, &dir.path().join("x"), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(result.status, Status::RuntimeError);
        assert!(result.error.unwrap().contains("empty"));
    }
}
