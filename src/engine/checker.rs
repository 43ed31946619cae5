//! Checker module for output judging
//!
//! A task may ship a checker program `prog/<task>chk.*`. It is invoked as
//! `checker <input> <produced output> <reference output>` and prints:
//!
//! ```text
//! OK            (anything else on the first line means wrong answer)
//! <comment>
//! <points>      (optional, defaults to 100)
//! ```
//!
//! Tasks without a checker are judged by a whitespace-insensitive comparison.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::core::JudgeError;

/// Default timeout for checker execution (in seconds)
pub const DEFAULT_CHECKER_TIMEOUT_SECS: u64 = 30;

/// Points awarded when the checker accepts without printing a score
const FULL_POINTS: f64 = 100.0;

/// Result of judging one output
#[derive(Debug, Clone, PartialEq)]
pub struct CheckerVerdict {
    pub accepted: bool,
    pub points: f64,
    /// Comment line printed by the checker, if any
    pub message: Option<String>,
}

impl CheckerVerdict {
    pub fn accepted(points: f64) -> Self {
        Self {
            accepted: true,
            points,
            message: None,
        }
    }

    pub fn wrong_answer(message: Option<String>) -> Self {
        Self {
            accepted: false,
            points: 0.0,
            message,
        }
    }
}

/// A compiled checker program
#[derive(Debug, Clone)]
pub struct Checker {
    path: PathBuf,
    timeout: Duration,
}

impl Checker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: Duration::from_secs(DEFAULT_CHECKER_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the checker on one produced output
    pub async fn check(&self, input: &Path, output: &Path, answer: &Path) -> Result<CheckerVerdict> {
        debug!(
            "Running checker: {:?} with input={:?}, output={:?}, answer={:?}",
            self.path, input, output, answer
        );

        let child = Command::new(&self.path)
            .arg(input)
            .arg(output)
            .arg(answer)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn checker {:?}", self.path))?;

        let result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| JudgeError::Checker("checker timed out".to_string()))?
            .context("Failed to wait for checker")?;

        let stdout = String::from_utf8_lossy(&result.stdout);
        debug!(
            "Checker result: exit_code={:?}, stdout={}",
            result.status.code(),
            stdout.chars().take(200).collect::<String>()
        );

        Ok(parse_checker_output(&stdout)?)
    }
}

/// Interpret checker stdout
pub fn parse_checker_output(stdout: &str) -> Result<CheckerVerdict, JudgeError> {
    let lines: Vec<&str> = stdout.lines().map(str::trim).collect();
    let Some(first) = lines.first() else {
        return Err(JudgeError::Checker("Checker output is empty".to_string()));
    };

    let message = lines
        .get(1)
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string());

    if *first != "OK" {
        return Ok(CheckerVerdict::wrong_answer(message));
    }

    let points = match lines.get(2).filter(|line| !line.is_empty()) {
        Some(raw) => raw.parse::<f64>().map_err(|_| {
            JudgeError::Checker(format!("Checker returned invalid points: {}", raw))
        })?,
        None => FULL_POINTS,
    };

    Ok(CheckerVerdict {
        accepted: true,
        points,
        message,
    })
}

/// Compare outputs ignoring whitespace layout within lines and trailing blank lines
pub fn compare_output(actual: &str, expected: &str) -> bool {
    let normalize = |s: &str| -> Vec<String> {
        let mut lines: Vec<String> = s
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect();
        while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        lines
    };

    normalize(actual) == normalize(expected)
}

/// Judge a produced output against the reference, with the checker if there is one
pub async fn judge_output(
    checker: Option<&Checker>,
    input: &Path,
    output: &Path,
    answer: &Path,
) -> Result<CheckerVerdict> {
    if let Some(checker) = checker {
        return checker.check(input, output, answer).await;
    }

    let actual = tokio::fs::read(output)
        .await
        .with_context(|| format!("Failed to read output {:?}", output))?;
    let expected = tokio::fs::read(answer)
        .await
        .with_context(|| format!("Failed to read answer {:?}", answer))?;

    if compare_output(&String::from_utf8_lossy(&actual), &String::from_utf8_lossy(&expected)) {
        Ok(CheckerVerdict::accepted(FULL_POINTS))
    } else {
        Ok(CheckerVerdict::wrong_answer(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_checker_ok_default_points() {
        let verdict = parse_checker_output("OK\n").unwrap();
        assert!(verdict.accepted);
        assert_eq!(verdict.points, 100.0);
    }

    #[test]
    fn test_parse_checker_partial_points() {
        let verdict = parse_checker_output("OK\nalmost\n42\n").unwrap();
        assert_eq!(verdict.points, 42.0);
        assert_eq!(verdict.message.as_deref(), Some("almost"));

        let fractional = parse_checker_output("OK\n\n12.5\n").unwrap();
        assert_eq!(fractional.points, 12.5);
    }

    #[test]
    fn test_parse_checker_wrong_answer() {
        let verdict = parse_checker_output("WRONG\nexpected 3, got 4\n").unwrap();
        assert!(!verdict.accepted);
        assert_eq!(verdict.points, 0.0);
        assert_eq!(verdict.message.as_deref(), Some("expected 3, got 4"));
    }

    #[test]
    fn test_parse_checker_errors() {
        assert!(matches!(parse_checker_output(""), Err(JudgeError::Checker(_))));
        assert!(matches!(
            parse_checker_output("OK\n\nlots\n"),
            Err(JudgeError::Checker(_))
        ));
    }

    #[test]
    fn test_compare_output_exact_match() {
        assert!(compare_output("hello\nworld\n", "hello\nworld\n"));
    }

    #[test]
    fn test_compare_output_whitespace() {
        assert!(compare_output("1   2\t3  \nworld\n", "1 2 3\nworld"));
        assert!(compare_output("hello\nworld\n\n\n", "hello\nworld\n"));
    }

    #[test]
    fn test_compare_output_different() {
        assert!(!compare_output("hello\nworld\n", "hello\nearth\n"));
        assert!(!compare_output("12\n", "1 2\n"));
        assert!(!compare_output("a\n\nb\n", "a\nb\n"));
    }

    #[tokio::test]
    async fn test_judge_output_with_checker_script() {
        let dir = tempfile::tempdir().unwrap();
        let checker_path = dir.path().join("abcchk.e");
        std::fs::write(&checker_path, "#!/bin/sh\necho OK\necho fine\necho 60\n").unwrap();
        std::fs::set_permissions(&checker_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        for name in ["in", "out", "ans"] {
            std::fs::write(dir.path().join(name), "1\n").unwrap();
        }

        let checker = Checker::new(&checker_path);
        let verdict = judge_output(
            Some(&checker),
            &dir.path().join("in"),
            &dir.path().join("out"),
            &dir.path().join("ans"),
        )
        .await
        .unwrap();
        assert_eq!(verdict.points, 60.0);
    }

    #[tokio::test]
    async fn test_judge_output_without_checker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out"), "3 4\n").unwrap();
        std::fs::write(dir.path().join("ans"), "3  4\n\n").unwrap();
        let verdict = judge_output(
            None,
            Path::new("/dev/null"),
            &dir.path().join("out"),
            &dir.path().join("ans"),
        )
        .await
        .unwrap();
        assert!(verdict.accepted);
    }
}
