use serde::{Deserialize, Serialize};

use super::status::Status;

/// Sentinel for a measurement the time tool did not report
pub const UNMEASURED: i64 = -1;

fn unmeasured() -> i64 {
    UNMEASURED
}

/// Normalized outcome of one execution, independent of the backend that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: Status,
    /// CPU time in milliseconds, -1 if unmeasured
    #[serde(default = "unmeasured")]
    pub time_ms: i64,
    /// Peak memory in KB, -1 if unmeasured
    #[serde(default = "unmeasured")]
    pub memory_kb: i64,
    /// Points awarded by the checker (0-100 unless the contest type says otherwise)
    #[serde(default)]
    pub points: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<i32>,
    /// Raw stderr of the program or the monitor, kept for diagnosis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl ExecutionResult {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            time_ms: UNMEASURED,
            memory_kb: UNMEASURED,
            points: 0.0,
            error: None,
            exit_signal: None,
            stderr: None,
        }
    }

    pub fn pending() -> Self {
        Self::new(Status::Pending)
    }

    pub fn compilation_error() -> Self {
        Self::new(Status::CompilationError)
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new(Status::RuntimeError).with_error(message)
    }

    pub fn with_time(mut self, time_ms: i64) -> Self {
        self.time_ms = time_ms;
        self
    }

    pub fn with_memory(mut self, memory_kb: i64) -> Self {
        self.memory_kb = memory_kb;
        self
    }

    pub fn with_points(mut self, points: f64) -> Self {
        self.points = points;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_signal(mut self, signal: i32) -> Self {
        self.exit_signal = Some(signal);
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    pub fn time(&self) -> Option<i64> {
        (self.time_ms >= 0).then_some(self.time_ms)
    }

    pub fn memory(&self) -> Option<i64> {
        (self.memory_kb >= 0).then_some(self.memory_kb)
    }
}

/// Human readable name of a signal number, e.g. `SIGSEGV`
pub fn signal_name(signal: i32) -> String {
    match nix::sys::signal::Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {}", signal),
    }
}
