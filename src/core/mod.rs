//! Shared result model: statuses, execution results, tests, errors and cancellation

pub mod cancel;
pub mod error;
pub mod result;
pub mod status;
pub mod testcase;
pub mod utils;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use error::JudgeError;
pub use result::ExecutionResult;
pub use status::Status;
pub use testcase::{GroupId, TestCase, EXAMPLE_GROUP};
