use thiserror::Error;

/// Failures the grading engine distinguishes between.
///
/// Only `Config` aborts a run before scheduling. The others are scoped to a
/// solution (`Compilation`), a single job (`Checker`, `MonitorFailure`) or the
/// whole run (`Cancelled`).
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("compilation of {solution} failed")]
    Compilation { solution: String, log: String },

    #[error("checker error: {0}")]
    Checker(String),

    /// The time tool itself produced output we cannot interpret
    #[error("time tool produced unexpected output: {message}")]
    MonitorFailure { message: String, raw: String },

    #[error("run cancelled by user")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl JudgeError {
    pub fn config(message: impl Into<String>) -> Self {
        JudgeError::Config(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JudgeError::Cancelled)
    }
}

/// True when an `anyhow` error chain carries `JudgeError::Cancelled`
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<JudgeError>()
        .map(JudgeError::is_cancelled)
        .unwrap_or(false)
}
