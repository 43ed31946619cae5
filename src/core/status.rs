use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome of running one solution on one test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Status {
    /// Not finished yet (never persisted)
    #[default]
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "CE")]
    CompilationError,
    /// Forbidden operation intercepted by the sandbox
    #[serde(rename = "RV")]
    RuleViolation,
    #[serde(rename = "TL", alias = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "ML", alias = "MLE")]
    MemoryLimitExceeded,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "OK")]
    Accepted,
}

impl Status {
    /// Position in the "worst status wins" order: CE > RV > TL > ML > RE > WA > OK > PENDING
    pub fn severity(self) -> u8 {
        match self {
            Status::Pending => 0,
            Status::Accepted => 1,
            Status::WrongAnswer => 2,
            Status::RuntimeError => 3,
            Status::MemoryLimitExceeded => 4,
            Status::TimeLimitExceeded => 5,
            Status::RuleViolation => 6,
            Status::CompilationError => 7,
        }
    }

    /// The worse of two statuses
    pub fn worst(self, other: Status) -> Status {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Fold a set of statuses with the worst-status rule. Empty input is `Pending`.
    pub fn worst_of(statuses: impl IntoIterator<Item = Status>) -> Status {
        statuses
            .into_iter()
            .fold(Status::Pending, |acc, status| acc.worst(status))
    }

    pub fn is_ok(self) -> bool {
        self == Status::Accepted
    }

    pub fn is_pending(self) -> bool {
        self == Status::Pending
    }

    /// Short code used in tables and config files
    pub fn code(self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::CompilationError => "CE",
            Status::RuleViolation => "RV",
            Status::TimeLimitExceeded => "TL",
            Status::MemoryLimitExceeded => "ML",
            Status::RuntimeError => "RE",
            Status::WrongAnswer => "WA",
            Status::Accepted => "OK",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "PENDING" => Ok(Status::Pending),
            "CE" => Ok(Status::CompilationError),
            "RV" => Ok(Status::RuleViolation),
            "TL" | "TLE" => Ok(Status::TimeLimitExceeded),
            "ML" | "MLE" => Ok(Status::MemoryLimitExceeded),
            "RE" => Ok(Status::RuntimeError),
            "WA" => Ok(Status::WrongAnswer),
            "OK" => Ok(Status::Accepted),
            other => Err(format!("Unknown status: {}", other)),
        }
    }
}
